//! `MeetingActor` — the per-meeting actor that owns all meeting state
//! (§3, §4.2–§4.7).
//!
//! One actor per live [`Meeting`] serializes every admission, presence,
//! moderator, and hand-raise mutation for that meeting, giving the total
//! order §5 requires without any explicit locking: the actor's mailbox
//! *is* the lock.
//!
//! Two families of deadlines drive the event loop besides inbound
//! messages: per-participant heartbeat watchdogs (§4.3, T_grace) and
//! hand-raise expiries (§4.7, T_hand). Both are modelled the way the
//! design notes ask (§9 "coroutines / event loops"): rather than spawning
//! a cancellable timer task per participant, the loop computes the
//! earliest pending deadline on each iteration and sleeps until then,
//! racing that sleep against the next inbound message in a `select!`. A
//! fresh heartbeat "cancels" the old watchdog simply by overwriting its
//! deadline in the map — there is nothing else to cancel.
//!
//! Watchdog deadlines are *not* recomputed from `last_seen_at` when a
//! meeting actor is spawned (including when resuming a live meeting after
//! a process restart, see [`MeetingActor::resume`]): the map starts empty
//! and is populated only by live heartbeats. This is what makes the
//! sweeper (§4.3 rule 5) the thing that notices participants whose
//! watchdog was lost to a restart, rather than the watchdog mechanism
//! springing back to life on its own (S4).

use crate::config::Config;
use crate::domain::{
    MediaIntent, Meeting, MeetingStatus, Participant, ParticipantRole, ParticipantStatus,
    RaisedHand, Session,
};
use crate::errors::ControlPlaneError;
use crate::identity::SystemRole;
use crate::store::Store;

use super::messages::{
    JoinOutcome, LowerReason, MediaTrack, MeetingMessage, MeetingSnapshot, OutboundEvent,
    TransferHostOutcome,
};
use super::metrics::{ActorType, MailboxMonitor};

use chrono::{DateTime, Utc};
use common::types::{MeetingId, ParticipantId, UserId};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for a meeting's mailbox.
const MEETING_CHANNEL_BUFFER: usize = 500;

/// Default broadcast channel capacity for outbound events. A slow
/// subscriber (the gateway's per-room writer) that falls behind this many
/// events starts missing the oldest ones; `Room` fan-out is best-effort
/// per §4.8, so this is an acceptable failure mode, not a correctness bug.
const OUTBOUND_CHANNEL_CAPACITY: usize = 512;

const INVITE_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const INVITE_CODE_GENERATION_ATTEMPTS: usize = 10;

/// Tunable timers carried from [`Config`] into each `MeetingActor` (§6).
#[derive(Debug, Clone, Copy)]
pub struct PresenceTimers {
    pub heartbeat_db_coalesce: chrono::Duration,
    pub heartbeat_grace: chrono::Duration,
    pub stale_sweep: chrono::Duration,
    pub hand_raise_ttl: chrono::Duration,
}

impl PresenceTimers {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_db_coalesce: chrono::Duration::seconds(
                i64::try_from(config.heartbeat_db_coalesce_seconds).unwrap_or(i64::MAX),
            ),
            heartbeat_grace: chrono::Duration::seconds(
                i64::try_from(config.heartbeat_grace_seconds).unwrap_or(i64::MAX),
            ),
            stale_sweep: chrono::Duration::seconds(
                i64::try_from(config.stale_sweep_seconds).unwrap_or(i64::MAX),
            ),
            hand_raise_ttl: chrono::Duration::seconds(
                i64::try_from(config.hand_raise_ttl_seconds).unwrap_or(i64::MAX),
            ),
        }
    }
}

/// Handle to a [`MeetingActor`]. Cheap to clone; every method sends one
/// message and awaits its response.
#[derive(Clone)]
pub struct MeetingActorHandle {
    sender: mpsc::Sender<MeetingMessage>,
    meeting_id: MeetingId,
    mailbox: Arc<MailboxMonitor>,
}

impl MeetingActorHandle {
    #[must_use]
    pub fn meeting_id(&self) -> MeetingId {
        self.meeting_id
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> MeetingMessage,
    ) -> Result<T, ControlPlaneError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| ControlPlaneError::Internal("meeting actor mailbox closed".to_string()))?;
        rx.await
            .map_err(|_| ControlPlaneError::Internal("meeting actor dropped response".to_string()))
    }

    pub async fn join(
        &self,
        user_id: Option<UserId>,
        display_name: String,
        invite_code: Option<String>,
        is_requester_host_or_admin: bool,
        socket_id: String,
    ) -> Result<JoinOutcome, ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::Join {
            user_id,
            display_name,
            invite_code,
            is_requester_host_or_admin,
            socket_id,
            respond_to,
        })
        .await?
    }

    pub async fn approve(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        participant_id: ParticipantId,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::Approve {
            by_user_id,
            by_system_role,
            participant_id,
            respond_to,
        })
        .await?
    }

    pub async fn reject(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        participant_id: ParticipantId,
        reason: Option<String>,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::Reject {
            by_user_id,
            by_system_role,
            participant_id,
            reason,
            respond_to,
        })
        .await?
    }

    pub async fn admit_all(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<usize, ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::AdmitAll {
            by_user_id,
            by_system_role,
            respond_to,
        })
        .await?
    }

    pub async fn leave(&self, participant_id: ParticipantId) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::Leave {
            participant_id,
            respond_to,
        })
        .await?
    }

    pub async fn kick(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_participant_id: ParticipantId,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::Kick {
            by_user_id,
            by_system_role,
            target_participant_id,
            respond_to,
        })
        .await?
    }

    /// Fire-and-forget: no response is awaited (§4.3, §4.8 "no durable
    /// queue"; a heartbeat that never arrives is simply a missed tick).
    pub async fn heartbeat(&self, participant_id: ParticipantId) {
        self.mailbox.record_enqueue();
        let _ = self
            .sender
            .send(MeetingMessage::Heartbeat { participant_id })
            .await;
    }

    pub async fn sweep_stale(&self, now_override_for_tests: Option<DateTime<Utc>>) -> usize {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(MeetingMessage::SweepStale {
                now_override_for_tests,
                respond_to: Some(tx),
            })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn force_mute(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_participant_id: ParticipantId,
        track: MediaTrack,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::ForceMute {
            by_user_id,
            by_system_role,
            target_participant_id,
            track,
            respond_to,
        })
        .await?
    }

    pub async fn force_screen_share_control(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_participant_id: ParticipantId,
        intent: MediaIntent,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::ForceScreenShareControl {
            by_user_id,
            by_system_role,
            target_participant_id,
            intent,
            respond_to,
        })
        .await?
    }

    pub async fn transfer_host(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        new_host_participant_id: ParticipantId,
        new_host_system_role: SystemRole,
    ) -> Result<TransferHostOutcome, ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::TransferHost {
            by_user_id,
            by_system_role,
            new_host_participant_id,
            new_host_system_role,
            respond_to,
        })
        .await?
    }

    pub async fn lock_room(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::LockRoom {
            by_user_id,
            by_system_role,
            respond_to,
        })
        .await?
    }

    pub async fn unlock_room(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::UnlockRoom {
            by_user_id,
            by_system_role,
            respond_to,
        })
        .await?
    }

    pub async fn start_meeting(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::StartMeeting {
            by_user_id,
            by_system_role,
            respond_to,
        })
        .await?
    }

    pub async fn end_meeting(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::EndMeeting {
            by_user_id,
            by_system_role,
            respond_to,
        })
        .await?
    }

    pub async fn rotate_invite_code(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<String, ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::RotateInviteCode {
            by_user_id,
            by_system_role,
            respond_to,
        })
        .await?
    }

    pub async fn raise_hand(
        &self,
        user_id: UserId,
        display_name: String,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::RaiseHand {
            user_id,
            display_name,
            respond_to,
        })
        .await?
    }

    pub async fn lower_hand(
        &self,
        user_id: UserId,
        reason: LowerReason,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::LowerHand {
            user_id,
            reason,
            respond_to,
        })
        .await?
    }

    pub async fn host_lower_hand(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_user_id: UserId,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::HostLowerHand {
            by_user_id,
            by_system_role,
            target_user_id,
            respond_to,
        })
        .await?
    }

    pub async fn lower_all_hands(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<(), ControlPlaneError> {
        self.call(|respond_to| MeetingMessage::LowerAllHands {
            by_user_id,
            by_system_role,
            respond_to,
        })
        .await?
    }

    pub async fn list_raised_hands(&self) -> Vec<RaisedHand> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(MeetingMessage::ListRaisedHands { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn chat_message(&self, from_user_id: UserId, display_name: String, text: String) {
        self.mailbox.record_enqueue();
        let _ = self
            .sender
            .send(MeetingMessage::ChatMessage {
                from_user_id,
                display_name,
                text,
            })
            .await;
    }

    pub async fn get_state(&self) -> Option<MeetingSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(MeetingMessage::GetState { respond_to: tx })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    pub async fn list_participants(
        &self,
        status_filter: Option<ParticipantStatus>,
    ) -> Vec<Participant> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(MeetingMessage::ListParticipants {
                status_filter,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get_participant(&self, participant_id: ParticipantId) -> Option<Participant> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(MeetingMessage::GetParticipant {
                participant_id,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn subscribe(&self) -> Option<broadcast::Receiver<OutboundEvent>> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(MeetingMessage::Subscribe { respond_to: tx })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    pub async fn socket_disconnected(&self, participant_id: ParticipantId) {
        self.mailbox.record_enqueue();
        let _ = self
            .sender
            .send(MeetingMessage::SocketDisconnected { participant_id })
            .await;
    }

    /// Current mailbox depth, exposed for the `observability::metrics`
    /// poller's per-actor gauge (§9 "global mutable state" — owned here,
    /// read externally, never mutated externally).
    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.current_depth()
    }
}

/// Owns all state for one meeting (§3 "ownership").
pub struct MeetingActor {
    receiver: mpsc::Receiver<MeetingMessage>,
    outbound: broadcast::Sender<OutboundEvent>,
    store: Arc<dyn Store>,
    timers: PresenceTimers,
    rng: SystemRandom,
    mailbox: Arc<MailboxMonitor>,

    meeting: Meeting,
    participants: HashMap<ParticipantId, Participant>,
    participants_by_user: HashMap<UserId, ParticipantId>,
    raised_hands: HashMap<UserId, RaisedHand>,

    /// Armed only by a live heartbeat; see module docs.
    watchdog_deadlines: HashMap<ParticipantId, DateTime<Utc>>,
    /// Tracks the last time `last_seen_at` was *persisted* for each
    /// participant, to coalesce writes at `T_db` (§4.3 rule 2).
    last_persisted_seen: HashMap<ParticipantId, DateTime<Utc>>,
}

impl MeetingActor {
    /// Spawn a fresh actor for a brand-new meeting.
    #[must_use]
    pub fn spawn(
        meeting: Meeting,
        store: Arc<dyn Store>,
        timers: PresenceTimers,
    ) -> MeetingActorHandle {
        Self::spawn_with_participants(meeting, Vec::new(), store, timers)
    }

    /// Spawn an actor resuming a meeting that was already live before a
    /// process restart, preloaded with its persisted participants. Watchdog
    /// deadlines start empty regardless of each participant's `last_seen_at`
    /// — see module docs and S4.
    #[must_use]
    pub fn spawn_with_participants(
        meeting: Meeting,
        participants: Vec<Participant>,
        store: Arc<dyn Store>,
        timers: PresenceTimers,
    ) -> MeetingActorHandle {
        let (sender, receiver) = mpsc::channel(MEETING_CHANNEL_BUFFER);
        let (outbound, _) = broadcast::channel(OUTBOUND_CHANNEL_CAPACITY);
        let meeting_id = meeting.id;
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Meeting, meeting_id.to_string()));

        let mut by_id = HashMap::new();
        let mut by_user = HashMap::new();
        for p in participants {
            if let Some(uid) = p.user_id {
                by_user.insert(uid, p.id);
            }
            by_id.insert(p.id, p);
        }

        let actor = MeetingActor {
            receiver,
            outbound,
            store,
            timers,
            rng: SystemRandom::new(),
            mailbox: mailbox.clone(),
            meeting,
            participants: by_id,
            participants_by_user: by_user,
            raised_hands: HashMap::new(),
            watchdog_deadlines: HashMap::new(),
            last_persisted_seen: HashMap::new(),
        };

        tokio::spawn(actor.run());

        MeetingActorHandle {
            sender,
            meeting_id,
            mailbox,
        }
    }

    #[instrument(skip(self), fields(meeting_id = %self.meeting.id))]
    async fn run(mut self) {
        info!(target: "mc.meeting", "meeting actor started");
        let mut sweep_ticker = tokio::time::interval(
            (self.timers.stale_sweep / 2)
                .to_std()
                .unwrap_or(StdDuration::from_secs(75)),
        );
        sweep_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let watchdog_sleep = sleep_until_deadline(self.next_watchdog_deadline());
            let hand_sleep = sleep_until_deadline(self.next_hand_deadline());

            tokio::select! {
                biased;

                maybe_msg = self.receiver.recv() => {
                    match maybe_msg {
                        Some(msg) => {
                            self.mailbox.record_dequeue();
                            self.handle(msg).await;
                        }
                        None => break,
                    }
                }
                () = watchdog_sleep => {
                    self.fire_expired_watchdogs(Utc::now()).await;
                }
                () = hand_sleep => {
                    self.expire_hands(Utc::now()).await;
                }
                _ = sweep_ticker.tick() => {
                    let closed = self.sweep_stale(Utc::now()).await;
                    if closed > 0 {
                        debug!(target: "mc.meeting", closed, "sweeper closed stale sessions");
                    }
                }
            }
        }
        info!(target: "mc.meeting", "meeting actor stopped");
    }

    fn next_watchdog_deadline(&self) -> Option<DateTime<Utc>> {
        self.watchdog_deadlines.values().copied().min()
    }

    fn next_hand_deadline(&self) -> Option<DateTime<Utc>> {
        self.raised_hands.values().map(|h| h.expires_at).min()
    }

    async fn handle(&mut self, msg: MeetingMessage) {
        match msg {
            MeetingMessage::Join {
                user_id,
                display_name,
                invite_code,
                is_requester_host_or_admin,
                socket_id,
                respond_to,
            } => {
                let result = self
                    .handle_join(
                        user_id,
                        display_name,
                        invite_code,
                        is_requester_host_or_admin,
                        socket_id,
                    )
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::Approve {
                by_user_id,
                by_system_role,
                participant_id,
                respond_to,
            } => {
                let result = self
                    .handle_approve(by_user_id, by_system_role, participant_id)
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::Reject {
                by_user_id,
                by_system_role,
                participant_id,
                reason,
                respond_to,
            } => {
                let result = self
                    .handle_reject(by_user_id, by_system_role, participant_id, reason)
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::AdmitAll {
                by_user_id,
                by_system_role,
                respond_to,
            } => {
                let result = self.handle_admit_all(by_user_id, by_system_role).await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::Leave {
                participant_id,
                respond_to,
            } => {
                let result = self.handle_leave(participant_id, Utc::now()).await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::Kick {
                by_user_id,
                by_system_role,
                target_participant_id,
                respond_to,
            } => {
                let result = self
                    .handle_kick(by_user_id, by_system_role, target_participant_id)
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::Heartbeat { participant_id } => {
                self.handle_heartbeat(participant_id, Utc::now()).await;
            }
            MeetingMessage::SweepStale {
                now_override_for_tests,
                respond_to,
            } => {
                let closed = self
                    .sweep_stale(now_override_for_tests.unwrap_or_else(Utc::now))
                    .await;
                if let Some(tx) = respond_to {
                    let _ = tx.send(closed);
                }
            }
            MeetingMessage::ForceMute {
                by_user_id,
                by_system_role,
                target_participant_id,
                track,
                respond_to,
            } => {
                let result = self
                    .handle_force_mute(by_user_id, by_system_role, target_participant_id, track)
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::ForceScreenShareControl {
                by_user_id,
                by_system_role,
                target_participant_id,
                intent,
                respond_to,
            } => {
                let result = self
                    .handle_force_screen_share(
                        by_user_id,
                        by_system_role,
                        target_participant_id,
                        intent,
                    )
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::TransferHost {
                by_user_id,
                by_system_role,
                new_host_participant_id,
                new_host_system_role,
                respond_to,
            } => {
                let result = self
                    .handle_transfer_host(
                        by_user_id,
                        by_system_role,
                        new_host_participant_id,
                        new_host_system_role,
                    )
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::LockRoom {
                by_user_id,
                by_system_role,
                respond_to,
            } => {
                let result = self.handle_lock_room(by_user_id, by_system_role, true).await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::UnlockRoom {
                by_user_id,
                by_system_role,
                respond_to,
            } => {
                let result = self
                    .handle_lock_room(by_user_id, by_system_role, false)
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::StartMeeting {
                by_user_id,
                by_system_role,
                respond_to,
            } => {
                let result = self.handle_start_meeting(by_user_id, by_system_role).await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::EndMeeting {
                by_user_id,
                by_system_role,
                respond_to,
            } => {
                let result = self
                    .handle_end_meeting(by_user_id, by_system_role, Utc::now())
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::RotateInviteCode {
                by_user_id,
                by_system_role,
                respond_to,
            } => {
                let result = self
                    .handle_rotate_invite_code(by_user_id, by_system_role)
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::RaiseHand {
                user_id,
                display_name,
                respond_to,
            } => {
                let result = self.handle_raise_hand(user_id, display_name).await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::LowerHand {
                user_id,
                reason,
                respond_to,
            } => {
                let result = self.handle_lower_hand(user_id, reason).await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::HostLowerHand {
                by_user_id,
                by_system_role,
                target_user_id,
                respond_to,
            } => {
                let result = self
                    .handle_host_lower_hand(by_user_id, by_system_role, target_user_id)
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::LowerAllHands {
                by_user_id,
                by_system_role,
                respond_to,
            } => {
                let result = self
                    .handle_lower_all_hands(by_user_id, by_system_role)
                    .await;
                let _ = respond_to.send(result);
            }
            MeetingMessage::ListRaisedHands { respond_to } => {
                let mut hands: Vec<RaisedHand> = self.raised_hands.values().cloned().collect();
                hands.sort_by_key(|h| h.raised_at);
                let _ = respond_to.send(hands);
            }
            MeetingMessage::ChatMessage {
                from_user_id,
                display_name,
                text,
            } => {
                self.broadcast(OutboundEvent::ChatMessage {
                    from_user_id,
                    display_name,
                    text,
                });
            }
            MeetingMessage::GetState { respond_to } => {
                let snapshot = self.snapshot();
                let _ = respond_to.send(snapshot);
            }
            MeetingMessage::ListParticipants {
                status_filter,
                respond_to,
            } => {
                let mut list: Vec<Participant> = self
                    .participants
                    .values()
                    .filter(|p| status_filter.is_none_or(|s| p.status == s))
                    .cloned()
                    .collect();
                list.sort_by_key(|p| p.created_at);
                let _ = respond_to.send(list);
            }
            MeetingMessage::GetParticipant {
                participant_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.participants.get(&participant_id).cloned());
            }
            MeetingMessage::Subscribe { respond_to } => {
                let _ = respond_to.send(self.outbound.subscribe());
            }
            MeetingMessage::SocketDisconnected { participant_id } => {
                self.handle_socket_disconnected(participant_id, Utc::now())
                    .await;
            }
        }
    }

    fn broadcast(&self, event: OutboundEvent) {
        // A broadcast channel with no subscribers returns Err; that is not
        // a failure (§7: "a failed broadcast to one recipient is logged
        // but does not fail the originating mutation").
        let _ = self.outbound.send(event);
    }

    fn snapshot(&self) -> MeetingSnapshot {
        let waiting_count = self
            .participants
            .values()
            .filter(|p| p.status == ParticipantStatus::Waiting)
            .count();
        let participant_count = self
            .participants
            .values()
            .filter(|p| p.status.is_in_room())
            .count();
        MeetingSnapshot {
            meeting: self.meeting.clone(),
            participant_count,
            waiting_count,
        }
    }

    fn is_moderator(&self, by_user_id: UserId, by_system_role: SystemRole) -> bool {
        by_system_role == SystemRole::Admin
            || by_user_id == self.meeting.current_host_id
            || by_user_id == self.meeting.host_id
            || self
                .participants_by_user
                .get(&by_user_id)
                .and_then(|pid| self.participants.get(pid))
                .is_some_and(|p| matches!(p.role, ParticipantRole::Host | ParticipantRole::CoHost))
    }

    fn require_moderator(
        &self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<(), ControlPlaneError> {
        if self.is_moderator(by_user_id, by_system_role) {
            Ok(())
        } else {
            Err(ControlPlaneError::Forbidden(
                "caller is not a host, co-host, or admin".to_string(),
            ))
        }
    }

    async fn persist_meeting(&self) -> Result<(), ControlPlaneError> {
        self.store.update_meeting(&self.meeting).await
    }

    async fn persist_participant(&self, p: &Participant) -> Result<(), ControlPlaneError> {
        self.store.update_participant(p).await
    }

    // ---------------------------------------------------------------
    // Admission State Machine (§4.4)
    // ---------------------------------------------------------------

    async fn handle_join(
        &mut self,
        user_id: Option<UserId>,
        display_name: String,
        invite_code: Option<String>,
        is_requester_host_or_admin: bool,
        socket_id: String,
    ) -> Result<JoinOutcome, ControlPlaneError> {
        if self.meeting.status == MeetingStatus::Ended {
            return Err(ControlPlaneError::InvalidState(
                "meeting has ended".to_string(),
            ));
        }

        if self.meeting.privacy_private {
            let supplied = invite_code.unwrap_or_default();
            if !supplied
                .trim()
                .eq_ignore_ascii_case(self.meeting.invite_code.trim())
            {
                return Err(ControlPlaneError::Forbidden(
                    "invite code does not match".to_string(),
                ));
            }
        }

        if self.meeting.lock_flag && !is_requester_host_or_admin {
            return Err(ControlPlaneError::RoomLocked);
        }

        let now = Utc::now();
        let role = if user_id == Some(self.meeting.current_host_id) {
            ParticipantRole::Host
        } else {
            ParticipantRole::Participant
        };
        let initial_status = if self.meeting.requires_approval() {
            ParticipantStatus::Waiting
        } else {
            ParticipantStatus::Admitted
        };

        // Q2: a re-joining user with the same userId continues the same
        // Participant record (upsertByUser), appending a new Session
        // rather than creating a fresh one.
        let existing_id = user_id.and_then(|uid| self.participants_by_user.get(&uid).copied());

        if let Some(id) = existing_id {
            if self
                .participants
                .get(&id)
                .is_some_and(|p| p.status == ParticipantStatus::Rejected)
            {
                return Err(ControlPlaneError::Forbidden(
                    "this participant was rejected from the meeting".to_string(),
                ));
            }
        }

        let mut participant = if let Some(id) = existing_id {
            let mut p = self
                .participants
                .get(&id)
                .cloned()
                .ok_or_else(|| ControlPlaneError::Internal("participant index desync".into()))?;
            p.display_name = display_name;
            p.role = role;
            p.status = initial_status;
            p.socket_id = Some(socket_id);
            p.last_seen_at = now;
            p
        } else {
            Participant {
                id: ParticipantId::new(),
                meeting_id: self.meeting.id,
                user_id,
                created_at: now,
                display_name,
                role,
                status: initial_status,
                mic_intent: MediaIntent::On,
                camera_intent: MediaIntent::On,
                screen_intent: MediaIntent::Off,
                has_hand_raised: false,
                hand_raised_at: None,
                hand_lowered_at: None,
                socket_id: Some(socket_id),
                last_seen_at: now,
                sessions: Vec::new(),
                total_duration_sec: 0,
            }
        };

        if initial_status == ParticipantStatus::Admitted {
            self.open_session_if_needed(&mut participant, now);
        }

        if existing_id.is_some() {
            self.persist_participant(&participant).await?;
        } else {
            self.store.insert_participant(&participant).await?;
        }

        let outcome = JoinOutcome {
            participant_id: participant.id,
            status: participant.status,
            role: participant.role,
        };

        if let Some(uid) = participant.user_id {
            self.participants_by_user.insert(uid, participant.id);
        }
        let participant_for_event = participant.clone();
        self.participants.insert(participant.id, participant);
        self.bump_participant_count().await;

        match initial_status {
            ParticipantStatus::Waiting => {
                self.broadcast(OutboundEvent::AdmissionParticipantWaiting {
                    participant: participant_for_event,
                });
            }
            ParticipantStatus::Admitted => {
                self.broadcast(OutboundEvent::PresenceUserJoined {
                    participant: participant_for_event.clone(),
                });
                self.broadcast(OutboundEvent::AdmissionParticipantAdmitted {
                    participant: participant_for_event,
                });
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Rule 1 (§4.3): open a new session on transition to admitted, unless
    /// one is already open (idempotent re-entry guard, not expected in
    /// normal operation but keeps the invariant airtight under retries).
    fn open_session_if_needed(&self, participant: &mut Participant, now: DateTime<Utc>) {
        if !participant.sessions.last().is_some_and(Session::is_open) {
            participant.sessions.push(Session::open(now));
        }
    }

    async fn bump_participant_count(&mut self) {
        let count = self
            .participants
            .values()
            .filter(|p| p.status.is_in_room())
            .count();
        #[allow(clippy::cast_possible_wrap)]
        {
            self.meeting.participant_count = count as i64;
        }
        let _ = self.persist_meeting().await;
    }

    async fn handle_approve(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        participant_id: ParticipantId,
    ) -> Result<(), ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;

        let Some(participant) = self.participants.get(&participant_id) else {
            return Err(ControlPlaneError::NotFound("participant".to_string()));
        };

        // R1: double-approve is a no-op once already admitted.
        if participant.status == ParticipantStatus::Admitted {
            return Ok(());
        }
        if participant.status != ParticipantStatus::Waiting {
            return Err(ControlPlaneError::InvalidState(
                "participant is not waiting for admission".to_string(),
            ));
        }

        let now = Utc::now();
        let mut participant = participant.clone();
        participant.status = ParticipantStatus::Admitted;
        self.open_session_if_needed(&mut participant, now);
        self.persist_participant(&participant).await?;
        self.participants.insert(participant_id, participant.clone());
        self.bump_participant_count().await;

        self.broadcast(OutboundEvent::PresenceUserJoined {
            participant: participant.clone(),
        });
        self.broadcast(OutboundEvent::AdmissionParticipantAdmitted { participant });
        Ok(())
    }

    async fn handle_reject(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        participant_id: ParticipantId,
        reason: Option<String>,
    ) -> Result<(), ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;

        let Some(participant) = self.participants.get(&participant_id) else {
            return Err(ControlPlaneError::NotFound("participant".to_string()));
        };
        if participant.status == ParticipantStatus::Rejected {
            return Ok(());
        }
        if participant.status != ParticipantStatus::Waiting {
            return Err(ControlPlaneError::InvalidState(
                "participant is not waiting for admission".to_string(),
            ));
        }

        let mut participant = participant.clone();
        participant.status = ParticipantStatus::Rejected;
        self.persist_participant(&participant).await?;
        self.participants.insert(participant_id, participant);

        self.broadcast(OutboundEvent::AdmissionParticipantRejected {
            participant_id,
            reason,
        });
        Ok(())
    }

    async fn handle_admit_all(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<usize, ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;

        let now = Utc::now();
        let waiting_ids: Vec<ParticipantId> = self
            .participants
            .values()
            .filter(|p| p.status == ParticipantStatus::Waiting)
            .map(|p| p.id)
            .collect();

        let mut admitted_ids = Vec::with_capacity(waiting_ids.len());
        for id in &waiting_ids {
            if let Some(participant) = self.participants.get_mut(id) {
                participant.status = ParticipantStatus::Admitted;
                self.open_session_if_needed(participant, now);
                let snapshot = participant.clone();
                if let Err(err) = self.store.update_participant(&snapshot).await {
                    warn!(target: "mc.meeting", %err, participant_id = %id, "admit_all: persistence failed");
                    continue;
                }
                admitted_ids.push(*id);
            }
        }

        if !admitted_ids.is_empty() {
            self.bump_participant_count().await;
            self.broadcast(OutboundEvent::AdmissionAllAdmitted {
                participant_ids: admitted_ids.clone(),
            });
        }
        Ok(admitted_ids.len())
    }

    async fn handle_leave(
        &mut self,
        participant_id: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<(), ControlPlaneError> {
        let Some(participant) = self.participants.get(&participant_id) else {
            return Err(ControlPlaneError::NotFound("participant".to_string()));
        };
        if participant.status == ParticipantStatus::Left {
            return Ok(());
        }

        let mut participant = participant.clone();
        self.close_open_session(&mut participant, now);
        participant.status = ParticipantStatus::Left;
        participant.socket_id = None;
        self.persist_participant(&participant).await?;
        self.participants.insert(participant_id, participant);
        self.watchdog_deadlines.remove(&participant_id);
        self.last_persisted_seen.remove(&participant_id);
        if let Some(uid) = self
            .participants
            .get(&participant_id)
            .and_then(|p| p.user_id)
        {
            self.raised_hands.remove(&uid);
        }
        self.bump_participant_count().await;

        self.broadcast(OutboundEvent::PresenceUserLeft { participant_id });
        Ok(())
    }

    async fn handle_kick(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_participant_id: ParticipantId,
    ) -> Result<(), ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;

        let now = Utc::now();
        let Some(participant) = self.participants.get(&target_participant_id) else {
            return Err(ControlPlaneError::NotFound("participant".to_string()));
        };
        if participant.status == ParticipantStatus::Left {
            return Ok(());
        }

        let mut participant = participant.clone();
        self.close_open_session(&mut participant, now);
        participant.status = ParticipantStatus::Left;
        participant.socket_id = None;
        self.persist_participant(&participant).await?;
        if let Some(uid) = self
            .participants
            .get(&target_participant_id)
            .and_then(|p| p.user_id)
        {
            self.raised_hands.remove(&uid);
        }
        self.participants
            .insert(target_participant_id, participant);
        self.watchdog_deadlines.remove(&target_participant_id);
        self.last_persisted_seen.remove(&target_participant_id);
        self.bump_participant_count().await;

        self.broadcast(OutboundEvent::ModeratorKicked {
            participant_id: target_participant_id,
        });
        Ok(())
    }

    // ---------------------------------------------------------------
    // Presence & Session Engine (§4.3)
    // ---------------------------------------------------------------

    fn close_open_session(&self, participant: &mut Participant, now: DateTime<Utc>) {
        if let Some(session) = participant.sessions.last_mut() {
            if session.is_open() {
                session.close(now);
                participant.total_duration_sec += session.duration_sec;
            }
        }
    }

    async fn handle_heartbeat(&mut self, participant_id: ParticipantId, now: DateTime<Utc>) {
        let Some(participant) = self.participants.get(&participant_id) else {
            return;
        };
        if !participant.status.is_in_room() {
            return;
        }

        let mut participant = participant.clone();

        // Rule 4: a heartbeat for a participant whose last session was
        // already closed is a reconnect — append a new session rather
        // than reopening the old one.
        if !participant.sessions.last().is_some_and(Session::is_open) {
            participant.sessions.push(Session::open(now));
            self.broadcast(OutboundEvent::PresenceUserJoined {
                participant: participant.clone(),
            });
        }

        participant.last_seen_at = now;

        let should_persist = self
            .last_persisted_seen
            .get(&participant_id)
            .is_none_or(|last| now - *last >= self.timers.heartbeat_db_coalesce);

        if should_persist {
            if self.persist_participant(&participant).await.is_ok() {
                self.last_persisted_seen.insert(participant_id, now);
            }
        }

        self.participants.insert(participant_id, participant);
        self.watchdog_deadlines
            .insert(participant_id, now + self.timers.heartbeat_grace);

        self.broadcast(OutboundEvent::PresenceHeartbeatAck { participant_id });
    }

    /// Per-participant watchdog fire (§4.3 rule 3): close the session for
    /// every participant whose deadline has passed. Does not touch
    /// `ParticipantStatus` — only the sweeper and explicit leave/kick do.
    async fn fire_expired_watchdogs(&mut self, now: DateTime<Utc>) {
        let expired: Vec<ParticipantId> = self
            .watchdog_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.watchdog_deadlines.remove(&id);
            if let Some(mut participant) = self.participants.get(&id).cloned() {
                let user_id = participant.user_id;
                self.close_open_session(&mut participant, now);
                if self.persist_participant(&participant).await.is_ok() {
                    self.participants.insert(id, participant);
                    self.broadcast(OutboundEvent::PresenceUserLeft { participant_id: id });
                    if let Some(uid) = user_id {
                        let _ = self.handle_lower_hand(uid, LowerReason::Disconnected).await;
                    }
                }
            }
        }
    }

    /// Sweeper (§4.3 rule 5): the safety net for participants whose
    /// watchdog was lost (e.g. to a process restart). Anyone with an open
    /// session and `lastSeenAt` older than `T_sweep` gets closed at
    /// `min(now, lastSeenAt + T_grace)` so downtime never inflates
    /// duration (S4).
    async fn sweep_stale(&mut self, now: DateTime<Utc>) -> usize {
        let stale: Vec<ParticipantId> = self
            .participants
            .values()
            .filter(|p| {
                p.status.is_in_room()
                    && p.sessions.last().is_some_and(Session::is_open)
                    && now - p.last_seen_at >= self.timers.stale_sweep
            })
            .map(|p| p.id)
            .collect();

        let mut closed = 0;
        for id in stale {
            if let Some(mut participant) = self.participants.get(&id).cloned() {
                let left_at = now.min(participant.last_seen_at + self.timers.heartbeat_grace);
                if let Some(session) = participant.sessions.last_mut() {
                    if session.is_open() {
                        session.close(left_at);
                        participant.total_duration_sec += session.duration_sec;
                    }
                }
                if self.persist_participant(&participant).await.is_ok() {
                    self.participants.insert(id, participant);
                    self.watchdog_deadlines.remove(&id);
                    self.broadcast(OutboundEvent::PresenceUserLeft { participant_id: id });
                    closed += 1;
                }
            }
        }
        closed
    }

    async fn handle_socket_disconnected(&mut self, participant_id: ParticipantId, now: DateTime<Utc>) {
        // A raw socket close is not necessarily an explicit leave — the
        // client may reconnect within the grace window (§4.3 B2). We only
        // clear the socket binding here; the watchdog (already armed by
        // the last heartbeat) is what eventually closes the session.
        let user_id = self
            .participants
            .get_mut(&participant_id)
            .map(|participant| {
                participant.socket_id = None;
                participant.user_id
            })
            .flatten();
        let _ = now;

        // §4.7/§4.8: a disconnecting socket also clears that user's
        // raised hand, regardless of whether the session itself closes
        // immediately or only after the watchdog grace period.
        if let Some(uid) = user_id {
            let _ = self.handle_lower_hand(uid, LowerReason::Disconnected).await;
        }
    }

    // ---------------------------------------------------------------
    // Moderator Control Plane (§4.5)
    // ---------------------------------------------------------------

    async fn handle_force_mute(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_participant_id: ParticipantId,
        track: MediaTrack,
    ) -> Result<(), ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;

        let Some(target) = self.participants.get(&target_participant_id) else {
            return Err(ControlPlaneError::NotFound("participant".to_string()));
        };
        if matches!(target.role, ParticipantRole::Host | ParticipantRole::CoHost)
            && by_user_id != self.meeting.host_id
        {
            return Err(ControlPlaneError::Forbidden(
                "only the original host may mute a host or co-host".to_string(),
            ));
        }

        let mut target = target.clone();
        match track {
            MediaTrack::Mic => target.mic_intent = MediaIntent::MutedByHost,
            MediaTrack::Camera => target.camera_intent = MediaIntent::OffByHost,
        }
        self.persist_participant(&target).await?;
        self.participants.insert(target_participant_id, target);

        self.broadcast(OutboundEvent::ModeratorForceMuted {
            participant_id: target_participant_id,
            track,
        });
        Ok(())
    }

    async fn handle_force_screen_share(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_participant_id: ParticipantId,
        intent: MediaIntent,
    ) -> Result<(), ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;

        let Some(target) = self.participants.get(&target_participant_id) else {
            return Err(ControlPlaneError::NotFound("participant".to_string()));
        };
        if matches!(target.role, ParticipantRole::Host | ParticipantRole::CoHost)
            && by_user_id != self.meeting.host_id
        {
            return Err(ControlPlaneError::Forbidden(
                "only the original host may control a host or co-host's screen share".to_string(),
            ));
        }

        let mut target = target.clone();
        target.screen_intent = intent;
        self.persist_participant(&target).await?;
        self.participants.insert(target_participant_id, target);

        self.broadcast(OutboundEvent::ModeratorScreenShareChanged {
            participant_id: target_participant_id,
            intent,
        });
        Ok(())
    }

    async fn handle_transfer_host(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        new_host_participant_id: ParticipantId,
        new_host_system_role: SystemRole,
    ) -> Result<TransferHostOutcome, ControlPlaneError> {
        // B4: only the previous (current) host, or an admin, may initiate.
        if by_system_role != SystemRole::Admin && by_user_id != self.meeting.current_host_id {
            return Err(ControlPlaneError::Forbidden(
                "only the current host or an admin may transfer host".to_string(),
            ));
        }

        let Some(new_host) = self.participants.get(&new_host_participant_id) else {
            return Err(ControlPlaneError::NotFound("participant".to_string()));
        };
        if !matches!(
            new_host_system_role,
            SystemRole::Tutor | SystemRole::Admin
        ) {
            return Err(ControlPlaneError::Forbidden(
                "new host must have systemRole tutor or admin".to_string(),
            ));
        }
        let Some(new_host_user_id) = new_host.user_id else {
            return Err(ControlPlaneError::InvalidState(
                "guests cannot become host".to_string(),
            ));
        };

        let previous_host_participant_id = self
            .participants_by_user
            .get(&self.meeting.current_host_id)
            .copied();

        if let Some(prev_id) = previous_host_participant_id {
            if let Some(prev) = self.participants.get_mut(&prev_id) {
                prev.role = ParticipantRole::Participant;
                let snapshot = prev.clone();
                self.persist_participant(&snapshot).await?;
            }
        }

        let mut new_host = new_host.clone();
        new_host.role = ParticipantRole::Host;
        let new_host_display_name = new_host.display_name.clone();
        self.persist_participant(&new_host).await?;
        self.participants
            .insert(new_host_participant_id, new_host);

        self.meeting.current_host_id = new_host_user_id;
        self.persist_meeting().await?;

        self.broadcast(OutboundEvent::ModeratorHostTransferred {
            new_host_participant_id,
            previous_host_participant_id,
        });

        Ok(TransferHostOutcome {
            new_host_user_id: Some(new_host_user_id),
            new_host_display_name,
            new_host_participant_id,
        })
    }

    async fn handle_lock_room(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        lock: bool,
    ) -> Result<(), ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;
        if self.meeting.status == MeetingStatus::Ended {
            return Err(ControlPlaneError::InvalidState(
                "meeting has ended".to_string(),
            ));
        }

        self.meeting.lock_flag = lock;
        self.persist_meeting().await?;

        self.broadcast(if lock {
            OutboundEvent::AdmissionRoomLocked
        } else {
            OutboundEvent::AdmissionRoomUnlocked
        });
        Ok(())
    }

    async fn handle_start_meeting(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<(), ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;
        if self.meeting.status != MeetingStatus::Scheduled {
            return Err(ControlPlaneError::InvalidState(
                "meeting is not in the scheduled state".to_string(),
            ));
        }

        self.meeting.status = MeetingStatus::Live;
        self.meeting.started_at = Some(Utc::now());
        self.persist_meeting().await?;

        self.broadcast(OutboundEvent::AdmissionMeetingStarted);
        Ok(())
    }

    async fn handle_end_meeting(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        now: DateTime<Utc>,
    ) -> Result<(), ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;

        // R2: idempotent after ended.
        if self.meeting.status == MeetingStatus::Ended {
            return Ok(());
        }

        let ids: Vec<ParticipantId> = self.participants.keys().copied().collect();
        for id in ids {
            if let Some(mut participant) = self.participants.get(&id).cloned() {
                self.close_open_session(&mut participant, now);
                if self.persist_participant(&participant).await.is_ok() {
                    self.participants.insert(id, participant);
                }
            }
        }
        self.watchdog_deadlines.clear();

        self.meeting.status = MeetingStatus::Ended;
        self.meeting.ended_at = Some(now);
        self.persist_meeting().await?;

        self.broadcast(OutboundEvent::AdmissionMeetingEnded);
        Ok(())
    }

    async fn handle_rotate_invite_code(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<String, ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;
        if self.meeting.status == MeetingStatus::Ended {
            return Err(ControlPlaneError::InvalidState(
                "meeting has ended".to_string(),
            ));
        }

        let mut candidate = generate_invite_code(&self.rng, 8);
        for _ in 0..INVITE_CODE_GENERATION_ATTEMPTS {
            match self.store.get_meeting_by_invite_code(&candidate).await {
                Ok(None) => break,
                _ => candidate = generate_invite_code(&self.rng, 8),
            }
        }

        self.meeting.invite_code = candidate.clone();
        self.persist_meeting().await?;
        Ok(candidate)
    }

    // ---------------------------------------------------------------
    // Hand-Raise Engine (§4.7)
    // ---------------------------------------------------------------

    async fn handle_raise_hand(
        &mut self,
        user_id: UserId,
        display_name: String,
    ) -> Result<(), ControlPlaneError> {
        // "inserts or is a no-op if already raised"
        if self.raised_hands.contains_key(&user_id) {
            return Ok(());
        }

        let now = Utc::now();
        let hand = RaisedHand {
            meeting_id: self.meeting.id,
            user_id,
            display_name: display_name.clone(),
            raised_at: now,
            expires_at: now + self.timers.hand_raise_ttl,
        };
        self.raised_hands.insert(user_id, hand);

        if let Some(pid) = self.participants_by_user.get(&user_id).copied() {
            if let Some(participant) = self.participants.get_mut(&pid) {
                participant.has_hand_raised = true;
                participant.hand_raised_at = Some(now);
                let snapshot = participant.clone();
                let _ = self.persist_participant(&snapshot).await;
            }
        }

        self.broadcast(OutboundEvent::HandRaised {
            user_id,
            display_name,
        });
        Ok(())
    }

    fn mark_hand_lowered(&mut self, user_id: UserId, at: DateTime<Utc>) {
        if let Some(pid) = self.participants_by_user.get(&user_id).copied() {
            if let Some(participant) = self.participants.get_mut(&pid) {
                participant.has_hand_raised = false;
                participant.hand_lowered_at = Some(at);
            }
        }
    }

    async fn handle_lower_hand(
        &mut self,
        user_id: UserId,
        reason: LowerReason,
    ) -> Result<(), ControlPlaneError> {
        if self.raised_hands.remove(&user_id).is_none() {
            return Ok(());
        }
        let now = Utc::now();
        self.mark_hand_lowered(user_id, now);
        if let Some(pid) = self.participants_by_user.get(&user_id).copied() {
            if let Some(participant) = self.participants.get(&pid).cloned() {
                let _ = self.persist_participant(&participant).await;
            }
        }

        self.broadcast(match reason {
            LowerReason::SelfLowered | LowerReason::Disconnected => {
                OutboundEvent::HandLowered { user_id }
            }
            LowerReason::Expired => OutboundEvent::HandAutoLowered { user_id },
        });
        Ok(())
    }

    async fn handle_host_lower_hand(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
        target_user_id: UserId,
    ) -> Result<(), ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;
        if self.raised_hands.remove(&target_user_id).is_none() {
            return Ok(());
        }
        let now = Utc::now();
        self.mark_hand_lowered(target_user_id, now);
        if let Some(pid) = self.participants_by_user.get(&target_user_id).copied() {
            if let Some(participant) = self.participants.get(&pid).cloned() {
                let _ = self.persist_participant(&participant).await;
            }
        }

        self.broadcast(OutboundEvent::HandLoweredByHost {
            user_id: target_user_id,
        });
        Ok(())
    }

    async fn handle_lower_all_hands(
        &mut self,
        by_user_id: UserId,
        by_system_role: SystemRole,
    ) -> Result<(), ControlPlaneError> {
        self.require_moderator(by_user_id, by_system_role)?;
        let now = Utc::now();
        let user_ids: Vec<UserId> = self.raised_hands.keys().copied().collect();
        self.raised_hands.clear();
        for uid in user_ids {
            self.mark_hand_lowered(uid, now);
            if let Some(pid) = self.participants_by_user.get(&uid).copied() {
                if let Some(participant) = self.participants.get(&pid).cloned() {
                    let _ = self.persist_participant(&participant).await;
                }
            }
        }

        self.broadcast(OutboundEvent::HandAllLowered);
        Ok(())
    }

    async fn expire_hands(&mut self, now: DateTime<Utc>) {
        let expired: Vec<UserId> = self
            .raised_hands
            .iter()
            .filter(|(_, h)| h.expires_at <= now)
            .map(|(uid, _)| *uid)
            .collect();

        for uid in expired {
            self.raised_hands.remove(&uid);
            self.mark_hand_lowered(uid, now);
            if let Some(pid) = self.participants_by_user.get(&uid).copied() {
                if let Some(participant) = self.participants.get(&pid).cloned() {
                    let _ = self.persist_participant(&participant).await;
                }
            }
            self.broadcast(OutboundEvent::HandAutoLowered { user_id: uid });
        }
    }
}

fn generate_invite_code(rng: &SystemRandom, len: usize) -> String {
    let mut bytes = vec![0u8; len];
    // `fill` only fails if the OS RNG is unavailable, which would already
    // be a fatal startup condition elsewhere in the process.
    if rng.fill(&mut bytes).is_err() {
        bytes = vec![0u8; len];
    }
    bytes
        .iter()
        .map(|b| {
            let idx = (*b as usize) % INVITE_CODE_ALPHABET.len();
            INVITE_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Sleeps until `deadline`, or forever if there is none. Used to race the
/// mailbox `recv()` against the earliest pending watchdog/hand-raise
/// expiry in `select!`.
async fn sleep_until_deadline(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(at) => {
            let now = Utc::now();
            let std_duration = (at - now).to_std().unwrap_or(StdDuration::ZERO);
            tokio::time::sleep_until(Instant::now() + std_duration).await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn timers() -> PresenceTimers {
        PresenceTimers {
            heartbeat_db_coalesce: chrono::Duration::seconds(30),
            heartbeat_grace: chrono::Duration::seconds(45),
            stale_sweep: chrono::Duration::seconds(150),
            hand_raise_ttl: chrono::Duration::seconds(120),
        }
    }

    fn sample_meeting(host_id: UserId, privacy_private: bool) -> Meeting {
        Meeting {
            id: MeetingId::new(),
            title: "Algebra".to_string(),
            invite_code: "X7QWPLMN".to_string(),
            privacy_private,
            lock_flag: false,
            status: MeetingStatus::Live,
            host_id,
            current_host_id: host_id,
            scheduled_for: None,
            started_at: Some(Utc::now()),
            ended_at: None,
            participant_count: 0,
        }
    }

    async fn spawn_test_actor(meeting: Meeting) -> (MeetingActorHandle, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store.insert_meeting(&meeting).await.unwrap();
        let handle = MeetingActor::spawn(meeting, store.clone(), timers());
        (handle, store)
    }

    #[tokio::test]
    async fn s1_private_meeting_gated_by_code_then_approved() {
        let host = UserId::new();
        let meeting = sample_meeting(host, true);
        let meeting_id = meeting.id;
        let (handle, _store) = spawn_test_actor(meeting).await;

        let alice = UserId::new();
        let outcome = handle
            .join(
                Some(alice),
                "Alice".to_string(),
                Some("x7qwplmn".to_string()),
                false,
                "sock-1".to_string(),
            )
            .await
            .expect("join should succeed");
        assert_eq!(outcome.status, ParticipantStatus::Waiting);

        handle
            .approve(host, SystemRole::Tutor, outcome.participant_id)
            .await
            .expect("approve should succeed");

        let participant = handle
            .get_participant(outcome.participant_id)
            .await
            .expect("participant should exist");
        assert_eq!(participant.status, ParticipantStatus::Admitted);
        assert_eq!(participant.sessions.len(), 1);
        assert!(participant.sessions[0].is_open());

        let snapshot = handle.get_state().await.expect("snapshot");
        assert_eq!(snapshot.meeting.id, meeting_id);
        assert_eq!(snapshot.participant_count, 1);
    }

    #[tokio::test]
    async fn double_approve_is_idempotent() {
        let host = UserId::new();
        let meeting = sample_meeting(host, true);
        let (handle, _store) = spawn_test_actor(meeting).await;

        let alice = UserId::new();
        let outcome = handle
            .join(
                Some(alice),
                "Alice".to_string(),
                Some("X7QWPLMN".to_string()),
                false,
                "sock-1".to_string(),
            )
            .await
            .unwrap();

        handle
            .approve(host, SystemRole::Tutor, outcome.participant_id)
            .await
            .unwrap();
        handle
            .approve(host, SystemRole::Tutor, outcome.participant_id)
            .await
            .unwrap();

        let participant = handle.get_participant(outcome.participant_id).await.unwrap();
        assert_eq!(participant.sessions.len(), 1);
    }

    #[tokio::test]
    async fn s5_room_lock_blocks_late_joiners() {
        let host = UserId::new();
        let meeting = sample_meeting(host, false);
        let (handle, _store) = spawn_test_actor(meeting).await;

        handle.lock_room(host, SystemRole::Tutor).await.unwrap();

        let late = UserId::new();
        let result = handle
            .join(Some(late), "Bob".to_string(), None, false, "sock-2".to_string())
            .await;
        assert!(matches!(result, Err(ControlPlaneError::RoomLocked)));

        handle.unlock_room(host, SystemRole::Tutor).await.unwrap();
        let result = handle
            .join(Some(late), "Bob".to_string(), None, false, "sock-2".to_string())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn s6_host_transfer_updates_role_and_forbids_old_host() {
        let host = UserId::new();
        let meeting = sample_meeting(host, false);
        let (handle, _store) = spawn_test_actor(meeting).await;

        let tutor = UserId::new();
        let outcome = handle
            .join(
                Some(tutor),
                "Tutor Two".to_string(),
                None,
                false,
                "sock-3".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, ParticipantStatus::Admitted);

        let result = handle
            .transfer_host(
                host,
                SystemRole::Tutor,
                outcome.participant_id,
                SystemRole::Tutor,
            )
            .await
            .unwrap();
        assert_eq!(result.new_host_user_id, Some(tutor));

        let snapshot = handle.get_state().await.unwrap();
        assert_eq!(snapshot.meeting.current_host_id, tutor);

        let new_host = handle.get_participant(outcome.participant_id).await.unwrap();
        assert_eq!(new_host.role, ParticipantRole::Host);

        // the old host can no longer moderate (not admin, not current host,
        // and their own Participant record, if any, is now role participant)
        let forbidden = handle
            .lock_room(host, SystemRole::Member)
            .await;
        assert!(matches!(forbidden, Err(ControlPlaneError::Forbidden(_))));
    }

    #[tokio::test]
    async fn double_end_meeting_is_idempotent() {
        let host = UserId::new();
        let meeting = sample_meeting(host, false);
        let (handle, _store) = spawn_test_actor(meeting).await;

        handle.end_meeting(host, SystemRole::Tutor).await.unwrap();
        handle.end_meeting(host, SystemRole::Tutor).await.unwrap();

        let snapshot = handle.get_state().await.unwrap();
        assert_eq!(snapshot.meeting.status, MeetingStatus::Ended);
    }

    #[tokio::test]
    async fn hand_raise_is_a_no_op_when_already_raised() {
        let host = UserId::new();
        let meeting = sample_meeting(host, false);
        let (handle, _store) = spawn_test_actor(meeting).await;

        let alice = UserId::new();
        handle
            .join(Some(alice), "Alice".to_string(), None, false, "s".to_string())
            .await
            .unwrap();

        handle.raise_hand(alice, "Alice".to_string()).await.unwrap();
        handle.raise_hand(alice, "Alice".to_string()).await.unwrap();

        let hands = handle.list_raised_hands().await;
        assert_eq!(hands.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_keeps_one_session() {
        let host = UserId::new();
        let meeting = sample_meeting(host, false);
        let (handle, _store) = spawn_test_actor(meeting).await;

        let alice = UserId::new();
        let outcome = handle
            .join(Some(alice), "Alice".to_string(), None, false, "s1".to_string())
            .await
            .unwrap();

        for _ in 0..3 {
            tokio::time::advance(StdDuration::from_secs(10)).await;
            handle.heartbeat(outcome.participant_id).await;
            tokio::task::yield_now().await;
        }

        // socket drops at t=30s; reconnect at t=60s (< T_grace=45s after
        // the last heartbeat at t=30 would fire at t=75 — well within).
        tokio::time::advance(StdDuration::from_secs(30)).await;
        handle.heartbeat(outcome.participant_id).await;
        tokio::task::yield_now().await;
        tokio::time::advance(StdDuration::from_secs(10)).await;
        handle.heartbeat(outcome.participant_id).await;
        tokio::task::yield_now().await;

        handle.leave(outcome.participant_id).await.unwrap();

        let participant = handle.get_participant(outcome.participant_id).await.unwrap();
        assert_eq!(participant.sessions.len(), 1);
        assert!(participant.total_duration_sec >= 79 && participant.total_duration_sec <= 81);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_grace_opens_a_new_session() {
        let host = UserId::new();
        let meeting = sample_meeting(host, false);
        let (handle, _store) = spawn_test_actor(meeting).await;

        let alice = UserId::new();
        let outcome = handle
            .join(Some(alice), "Alice".to_string(), None, false, "s1".to_string())
            .await
            .unwrap();

        handle.heartbeat(outcome.participant_id).await;
        tokio::task::yield_now().await;

        // No further heartbeats; the watchdog fires at T_grace = 45s.
        tokio::time::advance(StdDuration::from_secs(120)).await;
        tokio::task::yield_now().await;

        let participant = handle.get_participant(outcome.participant_id).await.unwrap();
        assert_eq!(participant.sessions.len(), 1);
        assert!(!participant.sessions[0].is_open());

        // Reconnect: a new heartbeat appends a new session.
        handle.heartbeat(outcome.participant_id).await;
        tokio::task::yield_now().await;

        let participant = handle.get_participant(outcome.participant_id).await.unwrap();
        assert_eq!(participant.sessions.len(), 2);
        assert!(participant.sessions[1].is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn s4_sweeper_recovers_ghost_after_restart() {
        // Simulate a restart: build a store with a persisted participant
        // whose session has been open since t=0, last_seen_at = t=100s,
        // then spawn a *fresh* actor over that state (no armed watchdog).
        let host = UserId::new();
        let mut meeting = sample_meeting(host, false);
        meeting.started_at = Some(Utc::now());
        let store = Arc::new(InMemoryStore::new());
        store.insert_meeting(&meeting).await.unwrap();

        let t0 = Utc::now();
        let alice = UserId::new();
        let participant = Participant {
            id: ParticipantId::new(),
            meeting_id: meeting.id,
            user_id: Some(alice),
            created_at: t0,
            display_name: "Alice".to_string(),
            role: ParticipantRole::Participant,
            status: ParticipantStatus::Admitted,
            mic_intent: MediaIntent::On,
            camera_intent: MediaIntent::On,
            screen_intent: MediaIntent::Off,
            has_hand_raised: false,
            hand_raised_at: None,
            hand_lowered_at: None,
            socket_id: None,
            last_seen_at: t0 + chrono::Duration::seconds(100),
            sessions: vec![Session::open(t0)],
            total_duration_sec: 0,
        };
        store.insert_participant(&participant).await.unwrap();

        let handle = MeetingActor::spawn_with_participants(
            meeting,
            vec![participant.clone()],
            store,
            timers(),
        );

        // Advance to t=260s (relative to actor spawn ~= t=100s mark); the
        // sweeper ticks every T_sweep/2 = 75s and will catch this well
        // before any test timeout.
        tokio::time::advance(StdDuration::from_secs(200)).await;
        tokio::task::yield_now().await;

        let closed = handle.get_participant(participant.id).await.unwrap();
        assert!(!closed.sessions[0].is_open());
    }

    #[tokio::test]
    async fn rejected_participant_cannot_rejoin() {
        let host = UserId::new();
        let meeting = sample_meeting(host, true);
        let (handle, _store) = spawn_test_actor(meeting).await;

        let bob = UserId::new();
        let outcome = handle
            .join(
                Some(bob),
                "Bob".to_string(),
                Some("X7QWPLMN".to_string()),
                false,
                "s1".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, ParticipantStatus::Waiting);

        handle
            .reject(host, SystemRole::Tutor, outcome.participant_id, None)
            .await
            .unwrap();
        let rejected = handle.get_participant(outcome.participant_id).await.unwrap();
        assert_eq!(rejected.status, ParticipantStatus::Rejected);

        let result = handle
            .join(
                Some(bob),
                "Bob".to_string(),
                Some("X7QWPLMN".to_string()),
                false,
                "s2".to_string(),
            )
            .await;
        assert!(matches!(result, Err(ControlPlaneError::Forbidden(_))));

        // the rejected record itself is untouched
        let still_rejected = handle.get_participant(outcome.participant_id).await.unwrap();
        assert_eq!(still_rejected.status, ParticipantStatus::Rejected);
    }

    #[tokio::test]
    async fn socket_disconnect_clears_raised_hand() {
        let host = UserId::new();
        let meeting = sample_meeting(host, false);
        let (handle, _store) = spawn_test_actor(meeting).await;

        let alice = UserId::new();
        let outcome = handle
            .join(Some(alice), "Alice".to_string(), None, false, "s1".to_string())
            .await
            .unwrap();
        handle.raise_hand(alice, "Alice".to_string()).await.unwrap();
        assert_eq!(handle.list_raised_hands().await.len(), 1);

        handle.socket_disconnected(outcome.participant_id).await;

        assert!(handle.list_raised_hands().await.is_empty());
        let participant = handle.get_participant(outcome.participant_id).await.unwrap();
        assert!(!participant.has_hand_raised);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_fire_clears_raised_hand() {
        let host = UserId::new();
        let meeting = sample_meeting(host, false);
        let (handle, _store) = spawn_test_actor(meeting).await;

        let alice = UserId::new();
        let outcome = handle
            .join(Some(alice), "Alice".to_string(), None, false, "s1".to_string())
            .await
            .unwrap();
        handle.heartbeat(outcome.participant_id).await;
        tokio::task::yield_now().await;
        handle.raise_hand(alice, "Alice".to_string()).await.unwrap();
        assert_eq!(handle.list_raised_hands().await.len(), 1);

        // No further heartbeats; the watchdog fires at T_grace = 45s.
        tokio::time::advance(StdDuration::from_secs(120)).await;
        tokio::task::yield_now().await;

        assert!(handle.list_raised_hands().await.is_empty());
        let participant = handle.get_participant(outcome.participant_id).await.unwrap();
        assert!(!participant.has_hand_raised);
    }
}
