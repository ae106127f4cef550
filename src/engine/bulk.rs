// Segmented iteration over large search results

//! # Segmented Bulk Iterator
//!
//! Working sets can span the whole repository, so results are streamed page by
//! page using a keyset cursor (the last [`RecordRef`] seen) and never
//! materialized in full. At most one page is buffered.
//!
//! The filter is re-evaluated for every page. Records changed by earlier items
//! so that they no longer match simply stop showing up, which is what makes
//! batch jobs resumable: a redelivered job only sees what is left.
//!
//! Cancellation is checked before every item is handed out and is returned to
//! the caller as an error, never swallowed.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use super::job::CancellationSignal;
use super::repository::{PageRequest, Repository};
use crate::models::{Record, RecordRef, SearchFilter};
use crate::Result;

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Paged, cancellable stream of records matching a filter
pub struct SegmentedIterator {
    repository: Arc<dyn Repository>,
    filter: SearchFilter,
    signal: CancellationSignal,
    page_size: usize,
    buffer: VecDeque<Record>,
    cursor: Option<RecordRef>,
    exhausted: bool,
    pages_fetched: usize,
}

impl SegmentedIterator {
    pub fn new(repository: Arc<dyn Repository>, filter: SearchFilter, signal: CancellationSignal) -> Self {
        Self {
            repository,
            filter,
            signal,
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
            pages_fetched: 0,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Next matching record, or `None` once the result set is exhausted
    ///
    /// ## Errors
    /// - `Cancelled` / `Aborted` when the signal fired
    /// - Repository errors from fetching the next page
    pub async fn next(&mut self) -> Result<Option<Record>> {
        self.signal.check()?;

        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }

        let record = self.buffer.pop_front();
        if let Some(record) = &record {
            self.cursor = Some(record.reference);
        }
        Ok(record)
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let page = PageRequest {
            after: self.cursor,
            limit: self.page_size,
        };
        let records = self.repository.search(&self.filter, page).await?;
        self.pages_fetched += 1;
        if records.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(records);
        Ok(())
    }

    /// Run `action` for every record, returning how many were visited
    pub async fn for_each<F, Fut>(mut self, mut action: F) -> Result<usize>
    where
        F: FnMut(Record) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut visited = 0;
        while let Some(record) = self.next().await? {
            action(record).await?;
            visited += 1;
        }
        Ok(visited)
    }
}
