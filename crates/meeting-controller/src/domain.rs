//! Data model (§3): Meeting, Participant, Session, RaisedHand.
//!
//! These are plain data types with the invariants documented inline; the
//! components in `actors::meeting` and `store` are what enforce them.

use chrono::{DateTime, Utc};
use common::types::{MeetingId, ParticipantId, UserId};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`Meeting`]. Monotone: `Scheduled` → `Live` →
/// `Ended`, no backtracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Scheduled,
    Live,
    Ended,
}

/// A meeting room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: MeetingId,
    pub title: String,
    /// Opaque, case-insensitive, unique among non-ended meetings.
    pub invite_code: String,
    pub privacy_private: bool,
    pub lock_flag: bool,
    pub status: MeetingStatus,
    /// Immutable original owner.
    pub host_id: UserId,
    /// Mutable current host; defaults to `host_id`.
    pub current_host_id: UserId,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub participant_count: i64,
}

impl Meeting {
    /// True if a join attempt should be gated through the waiting room:
    /// private meetings always gate; public meetings gate only when
    /// explicitly locked to non-host joiners (host policy is captured by
    /// `privacy_private` plus `lock_flag` per §4.4).
    #[must_use]
    pub fn requires_approval(&self) -> bool {
        self.privacy_private
    }
}

/// A participant's role within one meeting. Independent of the user's
/// system-wide role (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Host,
    CoHost,
    Presenter,
    Participant,
    Viewer,
}

impl ParticipantRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Host => "host",
            ParticipantRole::CoHost => "co_host",
            ParticipantRole::Presenter => "presenter",
            ParticipantRole::Participant => "participant",
            ParticipantRole::Viewer => "viewer",
        }
    }
}

/// Admission lifecycle state (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Waiting,
    Approved,
    Admitted,
    Rejected,
    Left,
}

impl ParticipantStatus {
    /// `Approved` is a transient pre-admit state treated as equivalent to
    /// `Admitted` for authorization purposes (§3).
    #[must_use]
    pub fn is_in_room(self) -> bool {
        matches!(self, ParticipantStatus::Admitted | ParticipantStatus::Approved)
    }
}

/// Media intent for one track. This is the participant's *intent*, not
/// authoritative media-plane state — the SFU is the source of truth for
/// whether a track is actually flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaIntent {
    On,
    Off,
    MutedByHost,
    OffByHost,
}

/// One continuous stretch of in-meeting presence (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    /// 0 while the session is open.
    pub duration_sec: i64,
}

impl Session {
    #[must_use]
    pub fn open(now: DateTime<Utc>) -> Self {
        Session {
            joined_at: now,
            left_at: None,
            duration_sec: 0,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.left_at.is_none()
    }

    /// Close the session at `now`, computing whole-second duration.
    pub fn close(&mut self, now: DateTime<Utc>) {
        if self.left_at.is_some() {
            return;
        }
        let duration = (now - self.joined_at).num_seconds().max(0);
        self.left_at = Some(now);
        self.duration_sec = duration;
    }
}

/// A participant's identity within one meeting (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub meeting_id: MeetingId,
    /// Absent for guest joins.
    pub user_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub display_name: String,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    pub mic_intent: MediaIntent,
    pub camera_intent: MediaIntent,
    pub screen_intent: MediaIntent,
    pub has_hand_raised: bool,
    pub hand_raised_at: Option<DateTime<Utc>>,
    pub hand_lowered_at: Option<DateTime<Utc>>,
    /// Current live connection, if any.
    pub socket_id: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub sessions: Vec<Session>,
    pub total_duration_sec: i64,
}

impl Participant {
    /// `isCurrentlyOnline` derived property (§4.3).
    #[must_use]
    pub fn is_currently_online(&self) -> bool {
        self.status.is_in_room()
            && self
                .sessions
                .last()
                .is_some_and(Session::is_open)
    }

    /// `firstLogin` derived property.
    #[must_use]
    pub fn first_login(&self) -> Option<DateTime<Utc>> {
        self.sessions.iter().map(|s| s.joined_at).min()
    }

    /// `lastLogin` derived property.
    #[must_use]
    pub fn last_login(&self) -> Option<DateTime<Utc>> {
        self.sessions.iter().map(|s| s.joined_at).max()
    }
}

/// A raised hand (§4.7). Soft, in-memory, not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaisedHand {
    pub meeting_id: MeetingId,
    pub user_id: UserId,
    pub display_name: String,
    pub raised_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_close_computes_whole_second_duration() {
        let start = Utc::now();
        let mut session = Session::open(start);
        assert!(session.is_open());

        let end = start + chrono::Duration::seconds(42);
        session.close(end);

        assert!(!session.is_open());
        assert_eq!(session.duration_sec, 42);
    }

    #[test]
    fn closing_an_already_closed_session_is_a_no_op() {
        let start = Utc::now();
        let mut session = Session::open(start);
        session.close(start + chrono::Duration::seconds(10));
        session.close(start + chrono::Duration::seconds(999));

        assert_eq!(session.duration_sec, 10);
    }

    #[test]
    fn participant_is_online_only_with_open_session_and_in_room_status() {
        let mut participant = Participant {
            id: ParticipantId::new(),
            meeting_id: MeetingId::new(),
            user_id: Some(UserId::new()),
            created_at: Utc::now(),
            display_name: "Ada".to_string(),
            role: ParticipantRole::Participant,
            status: ParticipantStatus::Admitted,
            mic_intent: MediaIntent::On,
            camera_intent: MediaIntent::On,
            screen_intent: MediaIntent::Off,
            has_hand_raised: false,
            hand_raised_at: None,
            hand_lowered_at: None,
            socket_id: None,
            last_seen_at: Utc::now(),
            sessions: vec![],
            total_duration_sec: 0,
        };

        assert!(!participant.is_currently_online());

        participant.sessions.push(Session::open(Utc::now()));
        assert!(participant.is_currently_online());

        participant.status = ParticipantStatus::Left;
        assert!(!participant.is_currently_online());
    }
}
