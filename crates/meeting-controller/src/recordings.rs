//! Recording storage boundary (§6).
//!
//! The control plane never records media itself, and recording
//! post-processing (VOD transcoding, playback, retention) is explicitly
//! out of scope. What the spec does require is that the *interface
//! boundary* to the external FileStore collaborator exist, so a future
//! recording pipeline has somewhere to plug in without reshaping the
//! control plane. [`RecordingStore`] is that seam: it has no concrete
//! production implementation here, only an in-memory test double.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{MeetingId, ParticipantId};
use std::collections::HashMap;
use std::sync::Mutex;

/// A recording artifact produced by the external SFU/FileStore pipeline
/// and registered with the control plane for attendance/admin visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingRef {
    pub meeting_id: MeetingId,
    /// Opaque storage key/URL in the FileStore; the control plane does
    /// not interpret this beyond passing it through.
    pub storage_key: String,
    pub started_by: ParticipantId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Errors a `RecordingStore` implementation may return.
#[derive(Debug, thiserror::Error)]
pub enum RecordingStoreError {
    #[error("no recording found for meeting")]
    NotFound,
    #[error("recording store unavailable: {0}")]
    Unavailable(String),
}

/// Registry of recording artifacts for a meeting, backed by an external
/// FileStore. Implementing this trait against a real object store (e.g.
/// S3-compatible storage) and a real post-processing pipeline is outside
/// this crate's scope; it exists so the rest of the control plane
/// (admin endpoints, attendance reads) can depend on an interface rather
/// than a concrete backend.
#[async_trait]
pub trait RecordingStore: Send + Sync {
    /// Register a new recording artifact for a meeting.
    ///
    /// # Errors
    ///
    /// Returns [`RecordingStoreError`] if the artifact cannot be recorded.
    async fn register(&self, recording: RecordingRef) -> Result<(), RecordingStoreError>;

    /// Mark the most recent open recording for a meeting as finished.
    ///
    /// # Errors
    ///
    /// Returns [`RecordingStoreError::NotFound`] if no open recording
    /// exists for the meeting.
    async fn finish(
        &self,
        meeting_id: MeetingId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), RecordingStoreError>;

    /// List every recording artifact registered for a meeting, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`RecordingStoreError`] if the listing cannot be read.
    async fn list_for_meeting(
        &self,
        meeting_id: MeetingId,
    ) -> Result<Vec<RecordingRef>, RecordingStoreError>;
}

/// In-memory `RecordingStore` used by tests and as a reference
/// implementation of the trait's contract. Not suitable for production:
/// it holds no data across process restarts and has no retention policy.
#[derive(Default)]
pub struct InMemoryRecordingStore {
    by_meeting: Mutex<HashMap<MeetingId, Vec<RecordingRef>>>,
}

impl InMemoryRecordingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordingStore for InMemoryRecordingStore {
    async fn register(&self, recording: RecordingRef) -> Result<(), RecordingStoreError> {
        let mut guard = self
            .by_meeting
            .lock()
            .map_err(|_| RecordingStoreError::Unavailable("lock poisoned".to_string()))?;
        guard.entry(recording.meeting_id).or_default().push(recording);
        Ok(())
    }

    async fn finish(
        &self,
        meeting_id: MeetingId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), RecordingStoreError> {
        let mut guard = self
            .by_meeting
            .lock()
            .map_err(|_| RecordingStoreError::Unavailable("lock poisoned".to_string()))?;
        let recordings = guard.get_mut(&meeting_id).ok_or(RecordingStoreError::NotFound)?;
        let open = recordings
            .iter_mut()
            .rev()
            .find(|r| r.ended_at.is_none())
            .ok_or(RecordingStoreError::NotFound)?;
        open.ended_at = Some(ended_at);
        Ok(())
    }

    async fn list_for_meeting(
        &self,
        meeting_id: MeetingId,
    ) -> Result<Vec<RecordingRef>, RecordingStoreError> {
        let guard = self
            .by_meeting
            .lock()
            .map_err(|_| RecordingStoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(guard.get(&meeting_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample(meeting_id: MeetingId) -> RecordingRef {
        RecordingRef {
            meeting_id,
            storage_key: "s3://recordings/abc".to_string(),
            started_by: ParticipantId::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn register_then_list_round_trips() {
        let store = InMemoryRecordingStore::new();
        let meeting_id = MeetingId::new();
        store.register(sample(meeting_id)).await.unwrap();

        let listed = store.list_for_meeting(meeting_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].ended_at.is_none());
    }

    #[tokio::test]
    async fn finish_closes_the_most_recent_open_recording() {
        let store = InMemoryRecordingStore::new();
        let meeting_id = MeetingId::new();
        store.register(sample(meeting_id)).await.unwrap();

        let ended_at = Utc::now();
        store.finish(meeting_id, ended_at).await.unwrap();

        let listed = store.list_for_meeting(meeting_id).await.unwrap();
        assert_eq!(listed[0].ended_at, Some(ended_at));
    }

    #[tokio::test]
    async fn finish_without_a_registered_recording_is_not_found() {
        let store = InMemoryRecordingStore::new();
        let meeting_id = MeetingId::new();

        let result = store.finish(meeting_id, Utc::now()).await;
        assert!(matches!(result, Err(RecordingStoreError::NotFound)));
    }

    #[tokio::test]
    async fn list_for_unknown_meeting_is_empty() {
        let store = InMemoryRecordingStore::new();
        let listed = store.list_for_meeting(MeetingId::new()).await.unwrap();
        assert!(listed.is_empty());
    }
}
