//! Forward-only streaming over a manager's rows.
//!
//! [`ResourceStream`] walks a table in id order using keyset pagination
//! (`WHERE id > last ORDER BY id LIMIT n`), so at most one page of rows is
//! buffered at a time.  Each row is materialized through the manager's
//! identity cache as it is handed out.
//!
//! A stream holds a cursor lease on the database from creation until it is
//! exhausted, closed, or dropped, whichever comes first.  Release happens
//! exactly once.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::db::CursorLease;
use crate::error::StoreResult;
use crate::record::Record;
use crate::resource::{Resource, ResourceKind, ResourceManager};

/// Default number of rows fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 64;

/// Lazy, non-restartable sequence of resources.
pub struct ResourceStream<K: ResourceKind> {
    manager: Arc<ResourceManager<K>>,
    page_size: usize,
    last_id: i64,
    page: VecDeque<Record<K::Fields>>,
    lease: Option<CursorLease>,
}

impl<K: ResourceKind> ResourceStream<K> {
    pub(crate) fn new(manager: Arc<ResourceManager<K>>, page_size: usize) -> Self {
        let lease = manager.database().lease_cursor();
        Self {
            manager,
            page_size: page_size.max(1),
            last_id: 0,
            page: VecDeque::new(),
            lease: Some(lease),
        }
    }

    /// Advance to the next resource.  `Ok(None)` once the stream is
    /// exhausted or closed.
    pub async fn next(&mut self, token: &CancellationToken) -> StoreResult<Option<Arc<Resource<K>>>> {
        loop {
            if let Some(record) = self.page.pop_front() {
                return self.manager.as_resource(record).map(Some);
            }
            if self.lease.is_none() {
                return Ok(None);
            }

            let page = self
                .manager
                .read_page(self.last_id, self.page_size, token)
                .await?;
            debug!(schema = K::NAME, after = self.last_id, rows = page.len(), "page fetched");

            if page.len() < self.page_size {
                // Short page: nothing follows, release the cursor now.
                self.lease = None;
            }
            if let Some(last) = page.last() {
                self.last_id = last.id;
            }
            self.page = page.into();
        }
    }

    /// Release the cursor and discard any buffered rows.  Safe to call more
    /// than once.
    pub fn close(&mut self) {
        self.page.clear();
        if self.lease.take().is_some() {
            debug!(schema = K::NAME, "stream closed");
        }
    }

    /// `true` while the stream still holds its cursor.
    pub fn is_open(&self) -> bool {
        self.lease.is_some()
    }

    /// Number of rows fetched but not yet handed out.
    pub fn buffered(&self) -> usize {
        self.page.len()
    }

    /// Adapt to a [`futures::Stream`].  An error ends the stream after it is
    /// yielded.
    pub fn into_stream(
        self,
        token: CancellationToken,
    ) -> impl Stream<Item = StoreResult<Arc<Resource<K>>>> + Send {
        futures::stream::unfold((self, token), |(mut stream, token)| async move {
            match stream.next(&token).await {
                Ok(Some(resource)) => Some((Ok(resource), (stream, token))),
                Ok(None) => None,
                Err(err) => {
                    stream.close();
                    Some((Err(err), (stream, token)))
                }
            }
        })
    }
}
