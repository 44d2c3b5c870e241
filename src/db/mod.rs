pub mod memory;
pub mod models;
pub mod repository;

pub use memory::MemoryStore;
pub use repository::Repository;

use crate::db::models::{IndexOperation, SearchRequest, SearchPage};
use crate::error::Result;
use async_trait::async_trait;

/// Storage backend for station readings.
///
/// Writes are id-keyed upserts; an id collision overwrites. Reads are single
/// bounded pages, resumable with the cursor of the previous page's last document.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Submit all operations as one unit. On error nothing is assumed committed.
    async fn bulk_upsert(&self, operations: &[IndexOperation]) -> Result<usize>;

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage>;

    async fn count(&self) -> Result<u64>;

    /// Largest page a single search may return.
    fn max_page_size(&self) -> usize;
}
