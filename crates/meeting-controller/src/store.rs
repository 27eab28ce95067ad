//! Persistent state layout (§6): a Postgres-backed document store.
//!
//! The spec leaves record shape to the implementer provided a handful of
//! access patterns stay efficient. We model `Meeting` and `Participant` as
//! relational rows with `sessions` kept as a JSONB column — the "document
//! store on a relational engine" pattern gc-service's own repositories use
//! for audit payloads, here applied to the whole `sessions[]` array so a
//! participant's full session timeline is one row read/write.

use crate::domain::{Meeting, MeetingStatus, Participant, ParticipantRole, ParticipantStatus};
use crate::errors::ControlPlaneError;
use async_trait::async_trait;
use common::types::{MeetingId, ParticipantId, UserId};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::instrument;

/// Authoritative mutator for `Meeting` and `Participant` records (§5:
/// "the Participant Store and Meeting Registry are the authoritative
/// mutators for their entities").
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_meeting(&self, meeting: &Meeting) -> Result<(), ControlPlaneError>;
    async fn get_meeting(&self, id: MeetingId) -> Result<Option<Meeting>, ControlPlaneError>;
    async fn get_meeting_by_invite_code(
        &self,
        code: &str,
    ) -> Result<Option<Meeting>, ControlPlaneError>;
    async fn update_meeting(&self, meeting: &Meeting) -> Result<(), ControlPlaneError>;
    async fn list_meetings(&self) -> Result<Vec<Meeting>, ControlPlaneError>;

    async fn insert_participant(&self, participant: &Participant) -> Result<(), ControlPlaneError>;
    async fn get_participant(
        &self,
        id: ParticipantId,
    ) -> Result<Option<Participant>, ControlPlaneError>;
    async fn get_participant_by_user(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
    ) -> Result<Option<Participant>, ControlPlaneError>;
    async fn update_participant(&self, participant: &Participant) -> Result<(), ControlPlaneError>;
    async fn list_participants_by_meeting(
        &self,
        meeting_id: MeetingId,
        status_filter: Option<ParticipantStatus>,
    ) -> Result<Vec<Participant>, ControlPlaneError>;
    /// Count participants with status in `{waiting, approved, admitted}`.
    async fn count_active_participants(
        &self,
        meeting_id: MeetingId,
    ) -> Result<i64, ControlPlaneError>;
}

/// `sqlx`/Postgres implementation of [`Store`].
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_label(status: MeetingStatus) -> &'static str {
    match status {
        MeetingStatus::Scheduled => "scheduled",
        MeetingStatus::Live => "live",
        MeetingStatus::Ended => "ended",
    }
}

fn parse_meeting_status(s: &str) -> MeetingStatus {
    match s {
        "live" => MeetingStatus::Live,
        "ended" => MeetingStatus::Ended,
        _ => MeetingStatus::Scheduled,
    }
}

fn participant_status_label(status: ParticipantStatus) -> &'static str {
    match status {
        ParticipantStatus::Waiting => "waiting",
        ParticipantStatus::Approved => "approved",
        ParticipantStatus::Admitted => "admitted",
        ParticipantStatus::Rejected => "rejected",
        ParticipantStatus::Left => "left",
    }
}

fn parse_participant_status(s: &str) -> ParticipantStatus {
    match s {
        "approved" => ParticipantStatus::Approved,
        "admitted" => ParticipantStatus::Admitted,
        "rejected" => ParticipantStatus::Rejected,
        "left" => ParticipantStatus::Left,
        _ => ParticipantStatus::Waiting,
    }
}

fn role_label(role: ParticipantRole) -> &'static str {
    role.as_str()
}

fn parse_role(s: &str) -> ParticipantRole {
    match s {
        "host" => ParticipantRole::Host,
        "co_host" => ParticipantRole::CoHost,
        "presenter" => ParticipantRole::Presenter,
        "viewer" => ParticipantRole::Viewer,
        _ => ParticipantRole::Participant,
    }
}

fn row_to_meeting(row: &sqlx::postgres::PgRow) -> Result<Meeting, ControlPlaneError> {
    let status: String = row.try_get("status").map_err(sqlx_err)?;
    Ok(Meeting {
        id: MeetingId(row.try_get("id").map_err(sqlx_err)?),
        title: row.try_get("title").map_err(sqlx_err)?,
        invite_code: row.try_get("invite_code").map_err(sqlx_err)?,
        privacy_private: row.try_get("privacy_private").map_err(sqlx_err)?,
        lock_flag: row.try_get("lock_flag").map_err(sqlx_err)?,
        status: parse_meeting_status(&status),
        host_id: UserId(row.try_get("host_id").map_err(sqlx_err)?),
        current_host_id: UserId(row.try_get("current_host_id").map_err(sqlx_err)?),
        scheduled_for: row.try_get("scheduled_for").map_err(sqlx_err)?,
        started_at: row.try_get("started_at").map_err(sqlx_err)?,
        ended_at: row.try_get("ended_at").map_err(sqlx_err)?,
        participant_count: row.try_get("participant_count").map_err(sqlx_err)?,
    })
}

fn row_to_participant(row: &sqlx::postgres::PgRow) -> Result<Participant, ControlPlaneError> {
    let status: String = row.try_get("status").map_err(sqlx_err)?;
    let role: String = row.try_get("role").map_err(sqlx_err)?;
    let mic: String = row.try_get("mic_intent").map_err(sqlx_err)?;
    let camera: String = row.try_get("camera_intent").map_err(sqlx_err)?;
    let screen: String = row.try_get("screen_intent").map_err(sqlx_err)?;
    let sessions: serde_json::Value = row.try_get("sessions").map_err(sqlx_err)?;
    let user_id: Option<uuid::Uuid> = row.try_get("user_id").map_err(sqlx_err)?;

    Ok(Participant {
        id: ParticipantId(row.try_get("id").map_err(sqlx_err)?),
        meeting_id: MeetingId(row.try_get("meeting_id").map_err(sqlx_err)?),
        user_id: user_id.map(UserId),
        created_at: row.try_get("created_at").map_err(sqlx_err)?,
        display_name: row.try_get("display_name").map_err(sqlx_err)?,
        role: parse_role(&role),
        status: parse_participant_status(&status),
        mic_intent: parse_media_intent(&mic),
        camera_intent: parse_media_intent(&camera),
        screen_intent: parse_media_intent(&screen),
        has_hand_raised: row.try_get("has_hand_raised").map_err(sqlx_err)?,
        hand_raised_at: row.try_get("hand_raised_at").map_err(sqlx_err)?,
        hand_lowered_at: row.try_get("hand_lowered_at").map_err(sqlx_err)?,
        socket_id: row.try_get("socket_id").map_err(sqlx_err)?,
        last_seen_at: row.try_get("last_seen_at").map_err(sqlx_err)?,
        sessions: serde_json::from_value(sessions).unwrap_or_default(),
        total_duration_sec: row.try_get("total_duration_sec").map_err(sqlx_err)?,
    })
}

fn media_intent_label(intent: crate::domain::MediaIntent) -> &'static str {
    use crate::domain::MediaIntent;
    match intent {
        MediaIntent::On => "on",
        MediaIntent::Off => "off",
        MediaIntent::MutedByHost => "muted_by_host",
        MediaIntent::OffByHost => "off_by_host",
    }
}

fn parse_media_intent(s: &str) -> crate::domain::MediaIntent {
    use crate::domain::MediaIntent;
    match s {
        "off" => MediaIntent::Off,
        "muted_by_host" => MediaIntent::MutedByHost,
        "off_by_host" => MediaIntent::OffByHost,
        _ => MediaIntent::On,
    }
}

fn sqlx_err(e: sqlx::Error) -> ControlPlaneError {
    ControlPlaneError::Store(e.to_string())
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip_all, name = "mc.store.insert_meeting")]
    async fn insert_meeting(&self, meeting: &Meeting) -> Result<(), ControlPlaneError> {
        sqlx::query(
            r"
            INSERT INTO meetings (
                id, title, invite_code, privacy_private, lock_flag, status,
                host_id, current_host_id, scheduled_for, started_at, ended_at,
                participant_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(meeting.id.0)
        .bind(&meeting.title)
        .bind(&meeting.invite_code)
        .bind(meeting.privacy_private)
        .bind(meeting.lock_flag)
        .bind(status_label(meeting.status))
        .bind(meeting.host_id.0)
        .bind(meeting.current_host_id.0)
        .bind(meeting.scheduled_for)
        .bind(meeting.started_at)
        .bind(meeting.ended_at)
        .bind(meeting.participant_count)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                ControlPlaneError::Conflict("invite code already in use".to_string())
            } else {
                sqlx_err(e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip_all, name = "mc.store.get_meeting")]
    async fn get_meeting(&self, id: MeetingId) -> Result<Option<Meeting>, ControlPlaneError> {
        let row = sqlx::query("SELECT * FROM meetings WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(row_to_meeting).transpose()
    }

    #[instrument(skip_all, name = "mc.store.get_meeting_by_invite_code")]
    async fn get_meeting_by_invite_code(
        &self,
        code: &str,
    ) -> Result<Option<Meeting>, ControlPlaneError> {
        let row = sqlx::query(
            "SELECT * FROM meetings WHERE lower(invite_code) = lower($1) AND status != 'ended'",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?;
        row.as_ref().map(row_to_meeting).transpose()
    }

    #[instrument(skip_all, name = "mc.store.update_meeting")]
    async fn update_meeting(&self, meeting: &Meeting) -> Result<(), ControlPlaneError> {
        sqlx::query(
            r"
            UPDATE meetings SET
                title = $2, invite_code = $3, privacy_private = $4, lock_flag = $5,
                status = $6, current_host_id = $7, scheduled_for = $8,
                started_at = $9, ended_at = $10, participant_count = $11
            WHERE id = $1
            ",
        )
        .bind(meeting.id.0)
        .bind(&meeting.title)
        .bind(&meeting.invite_code)
        .bind(meeting.privacy_private)
        .bind(meeting.lock_flag)
        .bind(status_label(meeting.status))
        .bind(meeting.current_host_id.0)
        .bind(meeting.scheduled_for)
        .bind(meeting.started_at)
        .bind(meeting.ended_at)
        .bind(meeting.participant_count)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    #[instrument(skip_all, name = "mc.store.list_meetings")]
    async fn list_meetings(&self) -> Result<Vec<Meeting>, ControlPlaneError> {
        let rows = sqlx::query("SELECT * FROM meetings ORDER BY started_at DESC NULLS LAST")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        rows.iter().map(row_to_meeting).collect()
    }

    #[instrument(skip_all, name = "mc.store.insert_participant")]
    async fn insert_participant(&self, p: &Participant) -> Result<(), ControlPlaneError> {
        let sessions = serde_json::to_value(&p.sessions).map_err(|e| {
            ControlPlaneError::Internal(format!("failed to serialize sessions: {e}"))
        })?;
        sqlx::query(
            r"
            INSERT INTO participants (
                id, meeting_id, user_id, created_at, display_name, role, status,
                mic_intent, camera_intent, screen_intent, has_hand_raised,
                hand_raised_at, hand_lowered_at, socket_id, last_seen_at,
                sessions, total_duration_sec
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            ",
        )
        .bind(p.id.0)
        .bind(p.meeting_id.0)
        .bind(p.user_id.map(|u| u.0))
        .bind(p.created_at)
        .bind(&p.display_name)
        .bind(role_label(p.role))
        .bind(participant_status_label(p.status))
        .bind(media_intent_label(p.mic_intent))
        .bind(media_intent_label(p.camera_intent))
        .bind(media_intent_label(p.screen_intent))
        .bind(p.has_hand_raised)
        .bind(p.hand_raised_at)
        .bind(p.hand_lowered_at)
        .bind(&p.socket_id)
        .bind(p.last_seen_at)
        .bind(sessions)
        .bind(p.total_duration_sec)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                ControlPlaneError::Conflict(
                    "participant already exists for this user in this meeting".to_string(),
                )
            } else {
                sqlx_err(e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip_all, name = "mc.store.get_participant")]
    async fn get_participant(
        &self,
        id: ParticipantId,
    ) -> Result<Option<Participant>, ControlPlaneError> {
        let row = sqlx::query("SELECT * FROM participants WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(row_to_participant).transpose()
    }

    #[instrument(skip_all, name = "mc.store.get_participant_by_user")]
    async fn get_participant_by_user(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
    ) -> Result<Option<Participant>, ControlPlaneError> {
        let row = sqlx::query("SELECT * FROM participants WHERE meeting_id = $1 AND user_id = $2")
            .bind(meeting_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(row_to_participant).transpose()
    }

    #[instrument(skip_all, name = "mc.store.update_participant")]
    async fn update_participant(&self, p: &Participant) -> Result<(), ControlPlaneError> {
        let sessions = serde_json::to_value(&p.sessions).map_err(|e| {
            ControlPlaneError::Internal(format!("failed to serialize sessions: {e}"))
        })?;
        sqlx::query(
            r"
            UPDATE participants SET
                display_name = $2, role = $3, status = $4, mic_intent = $5,
                camera_intent = $6, screen_intent = $7, has_hand_raised = $8,
                hand_raised_at = $9, hand_lowered_at = $10, socket_id = $11,
                last_seen_at = $12, sessions = $13, total_duration_sec = $14
            WHERE id = $1
            ",
        )
        .bind(p.id.0)
        .bind(&p.display_name)
        .bind(role_label(p.role))
        .bind(participant_status_label(p.status))
        .bind(media_intent_label(p.mic_intent))
        .bind(media_intent_label(p.camera_intent))
        .bind(media_intent_label(p.screen_intent))
        .bind(p.has_hand_raised)
        .bind(p.hand_raised_at)
        .bind(p.hand_lowered_at)
        .bind(&p.socket_id)
        .bind(p.last_seen_at)
        .bind(sessions)
        .bind(p.total_duration_sec)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    #[instrument(skip_all, name = "mc.store.list_participants_by_meeting")]
    async fn list_participants_by_meeting(
        &self,
        meeting_id: MeetingId,
        status_filter: Option<ParticipantStatus>,
    ) -> Result<Vec<Participant>, ControlPlaneError> {
        let rows = match status_filter {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM participants WHERE meeting_id = $1 AND status = $2 ORDER BY created_at ASC",
                )
                .bind(meeting_id.0)
                .bind(participant_status_label(status))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM participants WHERE meeting_id = $1 ORDER BY created_at ASC")
                    .bind(meeting_id.0)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(sqlx_err)?;
        rows.iter().map(row_to_participant).collect()
    }

    #[instrument(skip_all, name = "mc.store.count_active_participants")]
    async fn count_active_participants(
        &self,
        meeting_id: MeetingId,
    ) -> Result<i64, ControlPlaneError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM participants WHERE meeting_id = $1 AND status IN ('waiting', 'approved', 'admitted')",
        )
        .bind(meeting_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;
        row.try_get("cnt").map_err(sqlx_err)
    }
}

/// In-memory `Store` used by actor unit tests and the local dev profile.
/// Not used in production; production always runs against
/// [`PostgresStore`].
#[derive(Default)]
pub struct InMemoryStore {
    meetings: Mutex<HashMap<MeetingId, Meeting>>,
    participants: Mutex<HashMap<ParticipantId, Participant>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_meeting(&self, meeting: &Meeting) -> Result<(), ControlPlaneError> {
        let mut meetings = self.meetings.lock().unwrap_or_else(|e| e.into_inner());
        if meetings
            .values()
            .any(|m| m.status != MeetingStatus::Ended && m.invite_code.eq_ignore_ascii_case(&meeting.invite_code))
        {
            return Err(ControlPlaneError::Conflict(
                "invite code already in use".to_string(),
            ));
        }
        meetings.insert(meeting.id, meeting.clone());
        Ok(())
    }

    async fn get_meeting(&self, id: MeetingId) -> Result<Option<Meeting>, ControlPlaneError> {
        Ok(self
            .meetings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn get_meeting_by_invite_code(
        &self,
        code: &str,
    ) -> Result<Option<Meeting>, ControlPlaneError> {
        Ok(self
            .meetings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|m| m.status != MeetingStatus::Ended && m.invite_code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn update_meeting(&self, meeting: &Meeting) -> Result<(), ControlPlaneError> {
        self.meetings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(meeting.id, meeting.clone());
        Ok(())
    }

    async fn list_meetings(&self) -> Result<Vec<Meeting>, ControlPlaneError> {
        Ok(self
            .meetings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    async fn insert_participant(&self, participant: &Participant) -> Result<(), ControlPlaneError> {
        let mut participants = self.participants.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(uid) = participant.user_id {
            if participants
                .values()
                .any(|p| p.meeting_id == participant.meeting_id && p.user_id == Some(uid))
            {
                return Err(ControlPlaneError::Conflict(
                    "participant already exists for this user in this meeting".to_string(),
                ));
            }
        }
        participants.insert(participant.id, participant.clone());
        Ok(())
    }

    async fn get_participant(
        &self,
        id: ParticipantId,
    ) -> Result<Option<Participant>, ControlPlaneError> {
        Ok(self
            .participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn get_participant_by_user(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
    ) -> Result<Option<Participant>, ControlPlaneError> {
        Ok(self
            .participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|p| p.meeting_id == meeting_id && p.user_id == Some(user_id))
            .cloned())
    }

    async fn update_participant(&self, participant: &Participant) -> Result<(), ControlPlaneError> {
        self.participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(participant.id, participant.clone());
        Ok(())
    }

    async fn list_participants_by_meeting(
        &self,
        meeting_id: MeetingId,
        status_filter: Option<ParticipantStatus>,
    ) -> Result<Vec<Participant>, ControlPlaneError> {
        let mut result: Vec<Participant> = self
            .participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|p| {
                p.meeting_id == meeting_id
                    && status_filter.is_none_or(|s| p.status == s)
            })
            .cloned()
            .collect();
        result.sort_by_key(|p| p.created_at);
        Ok(result)
    }

    async fn count_active_participants(
        &self,
        meeting_id: MeetingId,
    ) -> Result<i64, ControlPlaneError> {
        let count = self
            .participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|p| {
                p.meeting_id == meeting_id
                    && matches!(
                        p.status,
                        ParticipantStatus::Waiting
                            | ParticipantStatus::Approved
                            | ParticipantStatus::Admitted
                    )
            })
            .count();
        Ok(count as i64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_meeting() -> Meeting {
        Meeting {
            id: MeetingId::new(),
            title: "Algebra".to_string(),
            invite_code: "ABCD1234".to_string(),
            privacy_private: false,
            lock_flag: false,
            status: MeetingStatus::Scheduled,
            host_id: UserId::new(),
            current_host_id: UserId::new(),
            scheduled_for: None,
            started_at: None,
            ended_at: None,
            participant_count: 0,
        }
    }

    #[tokio::test]
    async fn in_memory_store_rejects_duplicate_invite_codes() {
        let store = InMemoryStore::new();
        let a = sample_meeting();
        let mut b = sample_meeting();
        b.invite_code = a.invite_code.to_lowercase();

        store.insert_meeting(&a).await.expect("first insert ok");
        let result = store.insert_meeting(&b).await;
        assert!(matches!(result, Err(ControlPlaneError::Conflict(_))));
    }

    #[tokio::test]
    async fn in_memory_store_allows_reusing_invite_code_after_ended() {
        let store = InMemoryStore::new();
        let mut a = sample_meeting();
        a.status = MeetingStatus::Ended;
        let mut b = sample_meeting();
        b.id = MeetingId::new();

        store.insert_meeting(&a).await.expect("first insert ok");
        store.insert_meeting(&b).await.expect("reuse after ended ok");
    }

    #[tokio::test]
    async fn in_memory_store_enforces_one_participant_per_user_per_meeting() {
        let store = InMemoryStore::new();
        let meeting_id = MeetingId::new();
        let user_id = UserId::new();

        let p1 = Participant {
            id: ParticipantId::new(),
            meeting_id,
            user_id: Some(user_id),
            created_at: Utc::now(),
            display_name: "Ada".to_string(),
            role: ParticipantRole::Participant,
            status: ParticipantStatus::Waiting,
            mic_intent: crate::domain::MediaIntent::On,
            camera_intent: crate::domain::MediaIntent::On,
            screen_intent: crate::domain::MediaIntent::Off,
            has_hand_raised: false,
            hand_raised_at: None,
            hand_lowered_at: None,
            socket_id: None,
            last_seen_at: Utc::now(),
            sessions: vec![],
            total_duration_sec: 0,
        };
        let mut p2 = p1.clone();
        p2.id = ParticipantId::new();

        store.insert_participant(&p1).await.expect("first insert ok");
        let result = store.insert_participant(&p2).await;
        assert!(matches!(result, Err(ControlPlaneError::Conflict(_))));
    }
}
