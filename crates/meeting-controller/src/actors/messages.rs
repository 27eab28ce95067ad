//! Message types exchanged with the registry and meeting actors.

use crate::domain::{MediaIntent, Meeting, Participant, ParticipantRole, RaisedHand};
use crate::errors::ControlPlaneError;
use crate::identity::SystemRole;
use common::types::{MeetingId, ParticipantId, UserId};
use tokio::sync::oneshot;

/// Messages handled by the `MeetingControllerActor` (the registry).
pub enum ControllerMessage {
    /// Create a new meeting and spawn its actor.
    CreateMeeting {
        title: String,
        privacy_private: bool,
        host_id: UserId,
        scheduled_for: Option<chrono::DateTime<chrono::Utc>>,
        respond_to: oneshot::Sender<Result<Meeting, ControlPlaneError>>,
    },
    /// Look up a meeting actor handle by id.
    GetMeetingHandle {
        meeting_id: MeetingId,
        respond_to: oneshot::Sender<Option<super::meeting::MeetingActorHandle>>,
    },
    /// Resolve a meeting by its invite code (§4.1 `resolveByInviteCode`).
    ResolveByInviteCode {
        code: String,
        respond_to: oneshot::Sender<Result<Meeting, ControlPlaneError>>,
    },
    /// List all currently tracked (non-removed) meetings.
    ListMeetings {
        respond_to: oneshot::Sender<Vec<Meeting>>,
    },
    /// Remove a meeting's actor from the registry after it has ended and
    /// drained (does not touch persisted state).
    RemoveMeeting { meeting_id: MeetingId },
    /// Report current registry-wide counts for `/admin` endpoints.
    Stats {
        respond_to: oneshot::Sender<RegistryStats>,
    },
    /// Stale-participant stats across every live meeting (§6 admin endpoint).
    StaleParticipantsStats {
        threshold_sec: i64,
        respond_to: oneshot::Sender<Vec<StaleParticipantsReport>>,
    },
    /// Force a sweep across every live meeting right now (§6 admin endpoint).
    ManualCleanup {
        threshold_sec: i64,
        respond_to: oneshot::Sender<usize>,
    },
}

/// Snapshot returned by `ControllerMessage::Stats`.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub meeting_count: usize,
    pub participant_count: usize,
    /// Deepest mailbox among currently-running `MeetingActor`s, for the
    /// `mc_actor_mailbox_depth{actor_type="meeting"}` gauge.
    pub max_meeting_mailbox_depth: usize,
}

/// Per-meeting stale-participant count for the admin stats endpoint.
#[derive(Debug, Clone, Copy)]
pub struct StaleParticipantsReport {
    pub meeting_id: MeetingId,
    pub stale_count: usize,
}

/// Messages handled by a single `MeetingActor`. One actor per meeting
/// serializes every admission, presence, moderator, and hand-raise
/// operation for that meeting (§5's per-meeting total order).
pub enum MeetingMessage {
    // --- Admission State Machine (§4.4) ---
    Join {
        user_id: Option<UserId>,
        display_name: String,
        invite_code: Option<String>,
        is_requester_host_or_admin: bool,
        socket_id: String,
        respond_to: oneshot::Sender<Result<JoinOutcome, ControlPlaneError>>,
    },
    Approve {
        by_user_id: UserId,
        by_system_role: SystemRole,
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    Reject {
        by_user_id: UserId,
        by_system_role: SystemRole,
        participant_id: ParticipantId,
        reason: Option<String>,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    AdmitAll {
        by_user_id: UserId,
        by_system_role: SystemRole,
        respond_to: oneshot::Sender<Result<usize, ControlPlaneError>>,
    },
    Leave {
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    Kick {
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_participant_id: ParticipantId,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },

    // --- Presence & Session Engine (§4.3) ---
    Heartbeat {
        participant_id: ParticipantId,
    },
    SweepStale {
        now_override_for_tests: Option<chrono::DateTime<chrono::Utc>>,
        respond_to: Option<oneshot::Sender<usize>>,
    },

    // --- Moderator Control Plane (§4.5) ---
    ForceMute {
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_participant_id: ParticipantId,
        track: MediaTrack,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    ForceScreenShareControl {
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_participant_id: ParticipantId,
        intent: MediaIntent,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    TransferHost {
        by_user_id: UserId,
        by_system_role: SystemRole,
        new_host_participant_id: ParticipantId,
        new_host_system_role: SystemRole,
        respond_to: oneshot::Sender<Result<TransferHostOutcome, ControlPlaneError>>,
    },
    LockRoom {
        by_user_id: UserId,
        by_system_role: SystemRole,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    UnlockRoom {
        by_user_id: UserId,
        by_system_role: SystemRole,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    StartMeeting {
        by_user_id: UserId,
        by_system_role: SystemRole,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    EndMeeting {
        by_user_id: UserId,
        by_system_role: SystemRole,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    RotateInviteCode {
        by_user_id: UserId,
        by_system_role: SystemRole,
        respond_to: oneshot::Sender<Result<String, ControlPlaneError>>,
    },

    // --- Hand-Raise Engine (§4.7) ---
    RaiseHand {
        user_id: UserId,
        display_name: String,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    LowerHand {
        user_id: UserId,
        reason: LowerReason,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    HostLowerHand {
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_user_id: UserId,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    LowerAllHands {
        by_user_id: UserId,
        by_system_role: SystemRole,
        respond_to: oneshot::Sender<Result<(), ControlPlaneError>>,
    },
    ListRaisedHands {
        respond_to: oneshot::Sender<Vec<RaisedHand>>,
    },

    // --- Chat pass-through (§6: persistence/search out of scope) ---
    ChatMessage {
        from_user_id: UserId,
        display_name: String,
        text: String,
    },

    // --- Read-only state access ---
    GetState {
        respond_to: oneshot::Sender<MeetingSnapshot>,
    },
    ListParticipants {
        status_filter: Option<crate::domain::ParticipantStatus>,
        respond_to: oneshot::Sender<Vec<Participant>>,
    },
    GetParticipant {
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<Option<Participant>>,
    },

    /// Subscribe to this meeting's outbound event stream (used by the
    /// gateway to fan events out to connected sockets).
    Subscribe {
        respond_to: oneshot::Sender<tokio::sync::broadcast::Receiver<OutboundEvent>>,
    },

    /// Remove a disconnected socket's liveness association without tearing
    /// down the participant record (§4.8 step 5: socket close hands off to
    /// the presence engine for `explicitLeave` semantics, but only for
    /// sockets that never sent an explicit `Leave`).
    SocketDisconnected { participant_id: ParticipantId },
}

/// Which media track a moderator action targets (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaTrack {
    Mic,
    Camera,
}

/// Why a hand was lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerReason {
    SelfLowered,
    Expired,
    Disconnected,
}

/// Result of a join attempt.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub participant_id: ParticipantId,
    pub status: crate::domain::ParticipantStatus,
    pub role: ParticipantRole,
}

/// Result of a successful host transfer, carrying what the gateway needs
/// to mint and deliver a fresh SFU token to the new host (§4.5, §4.6).
#[derive(Debug, Clone)]
pub struct TransferHostOutcome {
    pub new_host_user_id: Option<UserId>,
    pub new_host_display_name: String,
    pub new_host_participant_id: ParticipantId,
}

/// A read-only snapshot of meeting state for admin/attendance reads.
#[derive(Debug, Clone)]
pub struct MeetingSnapshot {
    pub meeting: Meeting,
    pub participant_count: usize,
    pub waiting_count: usize,
}

/// Events broadcast to a meeting's room(s) (§4.8 event taxonomy). The
/// gateway maps each variant to the wire-level `event` string and
/// delivers it to the room(s) named in the comment.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    /// → room `meetingId`
    PresenceUserJoined { participant: Participant },
    /// → room `meetingId`
    PresenceUserLeft { participant_id: ParticipantId },
    /// → directed ack to sender only
    PresenceHeartbeatAck { participant_id: ParticipantId },

    /// → room `waiting:meetingId` and `host:meetingId`
    AdmissionParticipantWaiting { participant: Participant },
    /// → room `meetingId`
    AdmissionParticipantApproved { participant_id: ParticipantId },
    /// → room `waiting:meetingId`
    AdmissionParticipantRejected {
        participant_id: ParticipantId,
        reason: Option<String>,
    },
    /// → room `meetingId`
    AdmissionParticipantAdmitted { participant: Participant },
    /// → room `meetingId` (batch variant of `AdmissionParticipantAdmitted`)
    AdmissionAllAdmitted {
        participant_ids: Vec<ParticipantId>,
    },
    /// → room `waiting:meetingId`
    AdmissionMeetingStarted,
    /// → room `meetingId`
    AdmissionMeetingEnded,
    /// → room `meetingId`
    AdmissionRoomLocked,
    /// → room `meetingId`
    AdmissionRoomUnlocked,

    /// → room `meetingId`
    ModeratorForceMuted {
        participant_id: ParticipantId,
        track: MediaTrack,
    },
    /// → room `meetingId`
    ModeratorScreenShareChanged {
        participant_id: ParticipantId,
        intent: MediaIntent,
    },
    /// → room `meetingId`
    ModeratorHostTransferred {
        new_host_participant_id: ParticipantId,
        previous_host_participant_id: Option<ParticipantId>,
    },
    /// → room `meetingId`
    ModeratorKicked { participant_id: ParticipantId },

    /// → room `meetingId`
    HandRaised {
        user_id: UserId,
        display_name: String,
    },
    /// → room `meetingId`
    HandLowered { user_id: UserId },
    /// → room `meetingId`
    HandAutoLowered { user_id: UserId },
    /// → room `meetingId`
    HandLoweredByHost { user_id: UserId },
    /// → room `meetingId`
    HandAllLowered,

    /// → room `meetingId` (pass-through only; persistence is out of scope)
    ChatMessage {
        from_user_id: UserId,
        display_name: String,
        text: String,
    },
}
