// Change Service
// Source control metadata consumed while creating jobs. The real backend
// lives outside this crate; only the queries the scheduler needs are
// modelled here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{InvalidReason, ServiceError, ServiceResult};
use crate::jobs::StreamId;

/// Details of a shelved changelist
#[derive(Debug, Clone)]
pub struct ShelfDetails {
    pub change: u32,

    /// Streams touched by the shelved files
    pub streams: Vec<StreamId>,

    /// Number of shelved files
    pub file_count: usize,

    pub description: String,
}

/// Queries against the source control backend
#[async_trait]
pub trait ChangeService: Send + Sync {
    /// Most recent submitted change in a stream
    async fn latest_change(&self, stream_id: &StreamId) -> ServiceResult<Option<u32>>;

    /// Details of a shelved change, if it exists
    async fn shelf_details(&self, change: u32) -> ServiceResult<Option<ShelfDetails>>;
}

/// Check that a shelved change can be used as a preflight against the given
/// stream: it must contain files, and all of them from that stream
pub fn validate_shelf(stream_id: &StreamId, details: &ShelfDetails) -> ServiceResult<()> {
    if details.file_count == 0 {
        return Err(ServiceError::invalid(
            InvalidReason::EmptyShelf,
            format!("change {} has no shelved files", details.change),
        ));
    }
    if details.streams.len() > 1 {
        return Err(ServiceError::invalid(
            InvalidReason::WrongStream,
            format!(
                "change {} contains files from {} different streams",
                details.change,
                details.streams.len()
            ),
        ));
    }
    if details.streams.first() != Some(stream_id) {
        return Err(ServiceError::invalid(
            InvalidReason::WrongStream,
            format!("change {} is not shelved in stream {}", details.change, stream_id),
        ));
    }
    Ok(())
}

/// In-memory change service
#[derive(Default)]
pub struct InMemoryChangeService {
    latest: Arc<RwLock<HashMap<StreamId, u32>>>,
    shelves: Arc<RwLock<HashMap<u32, ShelfDetails>>>,
}

impl InMemoryChangeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_latest(&self, stream_id: StreamId, change: u32) {
        self.latest.write().await.insert(stream_id, change);
    }

    pub async fn add_shelf(&self, details: ShelfDetails) {
        self.shelves.write().await.insert(details.change, details);
    }
}

#[async_trait]
impl ChangeService for InMemoryChangeService {
    async fn latest_change(&self, stream_id: &StreamId) -> ServiceResult<Option<u32>> {
        Ok(self.latest.read().await.get(stream_id).copied())
    }

    async fn shelf_details(&self, change: u32) -> ServiceResult<Option<ShelfDetails>> {
        Ok(self.shelves.read().await.get(&change).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_shelf(change: u32, stream: &str, file_count: usize) -> ShelfDetails {
        ShelfDetails {
            change,
            streams: vec![StreamId::new(stream)],
            file_count,
            description: "Fix shader compile warnings".to_string(),
        }
    }

    #[test]
    fn test_validate_accepts_matching_stream() {
        let shelf = make_shelf(1234, "ue5-main", 3);
        assert!(validate_shelf(&StreamId::new("ue5-main"), &shelf).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_shelf() {
        let shelf = make_shelf(1234, "ue5-main", 0);
        let err = validate_shelf(&StreamId::new("ue5-main"), &shelf).unwrap_err();
        assert_eq!(err.reason(), Some(InvalidReason::EmptyShelf));
    }

    #[test]
    fn test_validate_rejects_wrong_stream() {
        let shelf = make_shelf(1234, "ue5-release", 3);
        let err = validate_shelf(&StreamId::new("ue5-main"), &shelf).unwrap_err();
        assert_eq!(err.reason(), Some(InvalidReason::WrongStream));
    }

    #[test]
    fn test_validate_rejects_mixed_streams() {
        let mut shelf = make_shelf(1234, "ue5-main", 3);
        shelf.streams.push(StreamId::new("ue5-release"));
        let err = validate_shelf(&StreamId::new("ue5-main"), &shelf).unwrap_err();
        assert_eq!(err.reason(), Some(InvalidReason::WrongStream));
    }

    #[tokio::test]
    async fn test_in_memory_lookup() {
        let changes = InMemoryChangeService::new();
        changes.set_latest(StreamId::new("ue5-main"), 5000).await;
        changes.add_shelf(make_shelf(1234, "ue5-main", 3)).await;

        let latest = changes.latest_change(&StreamId::new("ue5-main")).await.unwrap();
        assert_eq!(latest, Some(5000));

        let shelf = changes.shelf_details(1234).await.unwrap();
        assert_eq!(shelf.map(|details| details.file_count), Some(3));

        let missing = changes.shelf_details(9999).await.unwrap();
        assert!(missing.is_none());
    }
}
