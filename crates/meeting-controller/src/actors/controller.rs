//! `MeetingControllerActor` — the process-wide meeting registry (§4.1).
//!
//! One instance per process. Owns the map from [`MeetingId`] to a running
//! [`MeetingActorHandle`], creates meetings, resolves invite codes, and
//! answers the `/admin` aggregate queries (§6). Unlike a `MeetingActor`,
//! the registry has no presence timers of its own — its only background
//! behavior is resuming meetings that were still live when the process
//! last stopped.

use crate::config::Config;
use crate::domain::{Meeting, MeetingStatus};
use crate::errors::ControlPlaneError;
use crate::store::Store;

use super::meeting::{MeetingActor, MeetingActorHandle, PresenceTimers};
use super::messages::{ControllerMessage, RegistryStats, StaleParticipantsReport};
use super::metrics::{ActorType, MailboxMonitor};

use common::types::{MeetingId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

const CONTROLLER_CHANNEL_BUFFER: usize = 500;

/// Handle to the registry actor. One per process; cloned freely into the
/// gateway and admin HTTP handlers.
#[derive(Clone)]
pub struct ControllerActorHandle {
    sender: mpsc::Sender<ControllerMessage>,
    mailbox: Arc<MailboxMonitor>,
}

impl ControllerActorHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControllerMessage,
    ) -> Result<T, ControlPlaneError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| ControlPlaneError::Internal("registry actor mailbox closed".to_string()))?;
        rx.await.map_err(|_| {
            ControlPlaneError::Internal("registry actor dropped response".to_string())
        })
    }

    pub async fn create_meeting(
        &self,
        title: String,
        privacy_private: bool,
        host_id: UserId,
        scheduled_for: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Meeting, ControlPlaneError> {
        self.call(|respond_to| ControllerMessage::CreateMeeting {
            title,
            privacy_private,
            host_id,
            scheduled_for,
            respond_to,
        })
        .await?
    }

    pub async fn get_meeting_handle(&self, meeting_id: MeetingId) -> Option<MeetingActorHandle> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(ControllerMessage::GetMeetingHandle {
                meeting_id,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn resolve_by_invite_code(&self, code: String) -> Result<Meeting, ControlPlaneError> {
        self.call(|respond_to| ControllerMessage::ResolveByInviteCode { code, respond_to })
            .await?
    }

    pub async fn list_meetings(&self) -> Vec<Meeting> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(ControllerMessage::ListMeetings { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn remove_meeting(&self, meeting_id: MeetingId) {
        self.mailbox.record_enqueue();
        let _ = self
            .sender
            .send(ControllerMessage::RemoveMeeting { meeting_id })
            .await;
    }

    pub async fn stats(&self) -> RegistryStats {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(ControllerMessage::Stats { respond_to: tx })
            .await
            .is_err()
        {
            return RegistryStats {
                meeting_count: 0,
                participant_count: 0,
                max_meeting_mailbox_depth: 0,
            };
        }
        rx.await.unwrap_or(RegistryStats {
            meeting_count: 0,
            participant_count: 0,
            max_meeting_mailbox_depth: 0,
        })
    }

    pub async fn stale_participants_stats(
        &self,
        threshold_sec: i64,
    ) -> Vec<StaleParticipantsReport> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(ControllerMessage::StaleParticipantsStats {
                threshold_sec,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn manual_cleanup(&self, threshold_sec: i64) -> usize {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self
            .sender
            .send(ControllerMessage::ManualCleanup {
                threshold_sec,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Current mailbox depth, exposed for the `observability::metrics`
    /// poller's registry-actor gauge.
    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.current_depth()
    }
}

struct ControllerActor {
    receiver: mpsc::Receiver<ControllerMessage>,
    store: Arc<dyn Store>,
    timers: PresenceTimers,
    invite_code_len: usize,
    meetings: HashMap<MeetingId, MeetingActorHandle>,
    mailbox: Arc<MailboxMonitor>,
}

impl ControllerActor {
    /// Spawn the registry actor, resuming every meeting the store still
    /// considers non-ended (a crash or deploy leaves these "live" rows
    /// behind, see S4): each gets a fresh `MeetingActor` preloaded with its
    /// persisted participants, watchdogs unarmed until a new heartbeat.
    #[instrument(skip(store, config))]
    pub async fn spawn(store: Arc<dyn Store>, config: &Config) -> ControllerActorHandle {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let timers = PresenceTimers::from_config(config);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Registry, "registry"));

        let mut meetings = HashMap::new();
        match store.list_meetings().await {
            Ok(all) => {
                for meeting in all.into_iter().filter(|m| m.status != MeetingStatus::Ended) {
                    let participants = store
                        .list_participants_by_meeting(meeting.id, None)
                        .await
                        .unwrap_or_default();
                    info!(
                        target: "mc.registry",
                        meeting_id = %meeting.id,
                        participants = participants.len(),
                        "resuming live meeting after startup"
                    );
                    let handle = MeetingActor::spawn_with_participants(
                        meeting.clone(),
                        participants,
                        store.clone(),
                        timers,
                    );
                    meetings.insert(meeting.id, handle);
                }
            }
            Err(err) => {
                warn!(target: "mc.registry", %err, "failed to list meetings at startup");
            }
        }

        let actor = ControllerActor {
            receiver,
            store,
            timers,
            invite_code_len: config.invite_code_len,
            meetings,
            mailbox: mailbox.clone(),
        };

        tokio::spawn(actor.run());
        ControllerActorHandle { sender, mailbox }
    }

    async fn run(mut self) {
        info!(target: "mc.registry", "registry actor started");
        while let Some(msg) = self.receiver.recv().await {
            self.mailbox.record_dequeue();
            self.handle(msg).await;
        }
        info!(target: "mc.registry", "registry actor stopped");
    }

    async fn handle(&mut self, msg: ControllerMessage) {
        match msg {
            ControllerMessage::CreateMeeting {
                title,
                privacy_private,
                host_id,
                scheduled_for,
                respond_to,
            } => {
                let result = self
                    .handle_create_meeting(title, privacy_private, host_id, scheduled_for)
                    .await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::GetMeetingHandle {
                meeting_id,
                respond_to,
            } => {
                let handle = self.handle_get_meeting_handle(meeting_id).await;
                let _ = respond_to.send(handle);
            }
            ControllerMessage::ResolveByInviteCode { code, respond_to } => {
                let result = self.handle_resolve_by_invite_code(code).await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::ListMeetings { respond_to } => {
                let meetings = self.store.list_meetings().await.unwrap_or_default();
                let _ = respond_to.send(meetings);
            }
            ControllerMessage::RemoveMeeting { meeting_id } => {
                self.meetings.remove(&meeting_id);
            }
            ControllerMessage::Stats { respond_to } => {
                let stats = self.handle_stats().await;
                let _ = respond_to.send(stats);
            }
            ControllerMessage::StaleParticipantsStats {
                threshold_sec,
                respond_to,
            } => {
                let reports = self.handle_stale_participants_stats(threshold_sec).await;
                let _ = respond_to.send(reports);
            }
            ControllerMessage::ManualCleanup {
                threshold_sec,
                respond_to,
            } => {
                let closed = self.handle_manual_cleanup(threshold_sec).await;
                let _ = respond_to.send(closed);
            }
        }
    }

    async fn handle_create_meeting(
        &mut self,
        title: String,
        privacy_private: bool,
        host_id: UserId,
        scheduled_for: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Meeting, ControlPlaneError> {
        let invite_code = self.generate_unique_invite_code().await;

        let meeting = Meeting {
            id: MeetingId::new(),
            title,
            invite_code,
            privacy_private,
            lock_flag: false,
            status: MeetingStatus::Scheduled,
            host_id,
            current_host_id: host_id,
            scheduled_for,
            started_at: None,
            ended_at: None,
            participant_count: 0,
        };

        self.store.insert_meeting(&meeting).await?;
        let handle = MeetingActor::spawn(meeting.clone(), self.store.clone(), self.timers);
        self.meetings.insert(meeting.id, handle);

        info!(target: "mc.registry", meeting_id = %meeting.id, "meeting created");
        Ok(meeting)
    }

    async fn generate_unique_invite_code(&self) -> String {
        use ring::rand::{SecureRandom, SystemRandom};
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let rng = SystemRandom::new();

        for _ in 0..10 {
            let mut bytes = vec![0u8; self.invite_code_len];
            if rng.fill(&mut bytes).is_err() {
                break;
            }
            let candidate: String = bytes
                .iter()
                .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
                .collect();
            if matches!(
                self.store.get_meeting_by_invite_code(&candidate).await,
                Ok(None)
            ) {
                return candidate;
            }
        }
        // Pathological: ten collisions in a row. Fall back to a code
        // derived from a fresh meeting id, unique by construction.
        let fallback = MeetingId::new().to_string().replace('-', "").to_uppercase();
        fallback
            .chars()
            .take(self.invite_code_len)
            .collect()
    }

    /// Looks up a running actor by id, spawning one on demand (preloaded
    /// from the store) if the meeting exists and is not `Ended` but has
    /// no actor yet — e.g. a direct-by-id join right after a restart,
    /// before anyone has resolved it by invite code.
    async fn handle_get_meeting_handle(
        &mut self,
        meeting_id: MeetingId,
    ) -> Option<MeetingActorHandle> {
        if let Some(handle) = self.meetings.get(&meeting_id) {
            return Some(handle.clone());
        }
        let meeting = self.store.get_meeting(meeting_id).await.ok().flatten()?;
        if meeting.status == MeetingStatus::Ended {
            return None;
        }
        self.ensure_actor_running(&meeting).await;
        self.meetings.get(&meeting_id).cloned()
    }

    async fn handle_resolve_by_invite_code(
        &mut self,
        code: String,
    ) -> Result<Meeting, ControlPlaneError> {
        let meeting = self
            .store
            .get_meeting_by_invite_code(&code)
            .await?
            .ok_or_else(|| ControlPlaneError::NotFound("meeting".to_string()))?;

        self.ensure_actor_running(&meeting).await;
        Ok(meeting)
    }

    /// Spawns a `MeetingActor` for `meeting` if the registry doesn't
    /// already have one running — needed when a meeting is resolved by
    /// invite code before anyone has joined it since the last restart.
    async fn ensure_actor_running(&mut self, meeting: &Meeting) {
        if self.meetings.contains_key(&meeting.id) {
            return;
        }
        let participants = self
            .store
            .list_participants_by_meeting(meeting.id, None)
            .await
            .unwrap_or_default();
        let handle = MeetingActor::spawn_with_participants(
            meeting.clone(),
            participants,
            self.store.clone(),
            self.timers,
        );
        self.meetings.insert(meeting.id, handle);
    }

    async fn handle_stats(&self) -> RegistryStats {
        let mut participant_count = 0usize;
        let mut max_meeting_mailbox_depth = 0usize;
        for handle in self.meetings.values() {
            if let Some(snapshot) = handle.get_state().await {
                participant_count += snapshot.participant_count;
            }
            max_meeting_mailbox_depth = max_meeting_mailbox_depth.max(handle.mailbox_depth());
        }
        RegistryStats {
            meeting_count: self.meetings.len(),
            participant_count,
            max_meeting_mailbox_depth,
        }
    }

    async fn handle_stale_participants_stats(
        &self,
        threshold_sec: i64,
    ) -> Vec<StaleParticipantsReport> {
        let threshold = chrono::Duration::seconds(threshold_sec);
        let now = chrono::Utc::now();
        let mut reports = Vec::new();

        for (meeting_id, handle) in &self.meetings {
            let participants = handle.list_participants(None).await;
            let stale_count = participants
                .iter()
                .filter(|p| p.status.is_in_room() && now - p.last_seen_at >= threshold)
                .count();
            if stale_count > 0 {
                reports.push(StaleParticipantsReport {
                    meeting_id: *meeting_id,
                    stale_count,
                });
            }
        }
        reports
    }

    /// Forces an immediate sweep in every live meeting using each meeting
    /// actor's own configured `T_sweep` threshold. `threshold_sec` is
    /// accepted for API symmetry with the stats endpoint but does not
    /// override the per-actor sweep threshold — only the (read-only)
    /// stats report honors a caller-supplied window.
    async fn handle_manual_cleanup(&self, threshold_sec: i64) -> usize {
        let _ = threshold_sec;
        let mut total = 0usize;
        for handle in self.meetings.values() {
            total += handle.sweep_stale(None).await;
        }
        total
    }
}

/// Spawn the registry actor for this process.
pub async fn spawn_registry(store: Arc<dyn Store>, config: &Config) -> ControllerActorHandle {
    ControllerActor::spawn(store, config).await
}
