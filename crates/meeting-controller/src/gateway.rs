//! Realtime Gateway (§4.8).
//!
//! The authenticated, room-scoped message bus. Every realtime mutation
//! (admission, presence, moderation, hand-raise, chat) and every
//! management request (create meeting, resolve invite code, list
//! meetings, fetch attendance, rotate invite code) arrives as a `Frame`
//! over one authenticated WebSocket connection per client — there is no
//! separate HTTP CRUD surface (§1: HTTP framing is explicitly out of
//! scope). The operational-only `/admin` and `/health` HTTP endpoints
//! (`observability::admin`, `observability::health`) are unaffected.

use crate::actors::controller::ControllerActorHandle;
use crate::actors::meeting::MeetingActorHandle;
use crate::actors::messages::{LowerReason, MediaTrack, OutboundEvent};
use crate::domain::MediaIntent;
use crate::errors::ControlPlaneError;
use crate::identity::{IdentityResolver, Principal, SystemRole};
use crate::sfu_token::SfuTokenService;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common::types::{MeetingId, ParticipantId, UserId};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Bound on a per-socket outbound queue (§5: "bounded; on overflow, the
/// gateway closes the slow socket").
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Wire frame exchanged over the realtime gateway (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "correlationId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "requestRoom", default, skip_serializing_if = "Option::is_none")]
    pub request_room: Option<String>,
}

impl Frame {
    fn error(correlation_id: Option<String>, err: &ControlPlaneError) -> Self {
        Frame {
            event: "error".to_string(),
            payload: serde_json::json!({
                "code": err.error_code(),
                "type": err.error_type_label(),
                "message": err.client_message(),
            }),
            correlation_id,
            request_room: None,
        }
    }

    fn ack(event: &str, correlation_id: Option<String>, payload: serde_json::Value) -> Self {
        Frame {
            event: event.to_string(),
            payload,
            correlation_id,
            request_room: None,
        }
    }
}

fn main_room(id: MeetingId) -> String {
    id.to_string()
}

fn waiting_room(id: MeetingId) -> String {
    format!("waiting:{id}")
}

fn host_room(id: MeetingId) -> String {
    format!("host:{id}")
}

fn participant_room(id: ParticipantId) -> String {
    format!("participant:{id}")
}

/// A set of sockets sharing a room name, fed by one writer per socket.
#[derive(Clone, Default)]
struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, HashMap<Uuid, mpsc::Sender<Frame>>>>>,
}

impl RoomRegistry {
    async fn join(&self, room: &str, conn_id: Uuid, sender: mpsc::Sender<Frame>) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room.to_string()).or_default().insert(conn_id, sender);
    }

    async fn leave(&self, room: &str, conn_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    async fn leave_all(&self, conn_id: Uuid, room_names: &HashSet<String>) {
        for room in room_names {
            self.leave(room, conn_id).await;
        }
    }

    /// Deliver `frame` to every socket currently in `room`. Best-effort: a
    /// socket whose outbound queue is full is dropped from the room and its
    /// writer task will observe the channel closing on its own (§5: "if
    /// overrun, skip rather than stack").
    async fn broadcast(&self, room: &str, frame: Frame) {
        let members: Vec<(Uuid, mpsc::Sender<Frame>)> = {
            let rooms = self.rooms.read().await;
            match rooms.get(room) {
                Some(members) => members.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                None => return,
            }
        };
        for (conn_id, tx) in members {
            if tx.try_send(frame.clone()).is_err() {
                debug!(target: "mc.gateway", room = %room, conn_id = %conn_id, "dropping slow/closed socket from room");
                self.leave(room, conn_id).await;
            }
        }
    }
}

/// Shared state for the realtime gateway's axum router.
#[derive(Clone)]
pub struct GatewayState {
    controller: ControllerActorHandle,
    identity: Arc<RwLock<IdentityResolver>>,
    sfu_tokens: Arc<SfuTokenService>,
    rooms: RoomRegistry,
    forwarders: Arc<Mutex<HashSet<MeetingId>>>,
}

impl GatewayState {
    #[must_use]
    pub fn new(
        controller: ControllerActorHandle,
        identity: Arc<RwLock<IdentityResolver>>,
        sfu_tokens: Arc<SfuTokenService>,
    ) -> Self {
        Self {
            controller,
            identity,
            sfu_tokens,
            rooms: RoomRegistry::default(),
            forwarders: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

/// Build the gateway's axum router. Mounted alongside (but independent
/// from) the `/admin` and `/health` HTTP routers.
pub fn gateway_router(state: GatewayState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsAuthQuery {
    token: Option<String>,
}

fn extract_bearer(headers: &HeaderMap, query_token: Option<String>) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(raw) = value.to_str() {
            if let Some(token) = raw.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    query_token
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsAuthQuery>,
    headers: HeaderMap,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    let token = extract_bearer(&headers, query.token);
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

/// Everything the per-connection task needs to track for cleanup and
/// directed delivery.
struct ConnectionContext {
    id: Uuid,
    principal: Principal,
    outbound_tx: mpsc::Sender<Frame>,
    joined_rooms: Mutex<HashSet<String>>,
    /// Meetings this socket has an admitted/waiting `Participant` in,
    /// needed at close time to hand off to the Presence Engine (§4.8 step 5).
    participants: Mutex<HashMap<MeetingId, ParticipantId>>,
}

impl ConnectionContext {
    async fn join_room(&self, registry: &RoomRegistry, room: String) {
        registry.join(&room, self.id, self.outbound_tx.clone()).await;
        self.joined_rooms.lock().await.insert(room);
    }

    async fn leave_room(&self, registry: &RoomRegistry, room: &str) {
        registry.leave(room, self.id).await;
        self.joined_rooms.lock().await.remove(room);
    }
}

#[instrument(skip_all)]
async fn handle_socket(socket: WebSocket, state: GatewayState, token: Option<String>) {
    let (mut sink, mut stream) = socket.split();

    let principal = match token {
        None => {
            let _ = sink
                .send(Message::Text(
                    serde_json::to_string(&Frame::error(None, &ControlPlaneError::AuthRequired))
                        .unwrap_or_default(),
                ))
                .await;
            return;
        }
        Some(token) => {
            // Signature verification is pure CPU work against an
            // already-cached key set, so no explicit timeout is needed
            // beyond the JWKS refresh cadence that keeps the cache warm.
            let result = state.identity.read().await.verify_bearer(&token);
            match result {
                Ok(principal) => principal,
                Err(err) => {
                    let _ = sink
                        .send(Message::Text(
                            serde_json::to_string(&Frame::error(None, &err)).unwrap_or_default(),
                        ))
                        .await;
                    return;
                }
            }
        }
    };

    info!(target: "mc.gateway", user_id = %principal.user_id, "socket authenticated");

    let conn_id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let ctx = Arc::new(ConnectionContext {
        id: conn_id,
        principal,
        outbound_tx,
        joined_rooms: Mutex::new(HashSet::new()),
        participants: Mutex::new(HashMap::new()),
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(err) => {
                debug!(target: "mc.gateway", %err, "websocket read error, closing");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                let frame: Frame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(err) => {
                        let _ = ctx
                            .outbound_tx
                            .send(Frame::error(
                                None,
                                &ControlPlaneError::BadRequest(format!("malformed frame: {err}")),
                            ))
                            .await;
                        continue;
                    }
                };
                if let Some(reply) = handle_inbound_frame(&state, &ctx, frame).await {
                    let _ = ctx.outbound_tx.send(reply).await;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    cleanup_connection(&state, &ctx).await;
    writer.abort();
}

async fn cleanup_connection(state: &GatewayState, ctx: &ConnectionContext) {
    let rooms = ctx.joined_rooms.lock().await.clone();
    state.rooms.leave_all(ctx.id, &rooms).await;

    let participants = ctx.participants.lock().await.clone();
    for (meeting_id, participant_id) in participants {
        if let Some(handle) = state.controller.get_meeting_handle(meeting_id).await {
            handle.socket_disconnected(participant_id).await;
        }
    }
    info!(target: "mc.gateway", user_id = %ctx.principal.user_id, "socket closed");
}

/// Dispatch one inbound frame. Returns `Some(frame)` to send directly back
/// to the sender (an ack or error), or `None` for a fire-and-forget
/// message whose effects (if any) are delivered later via the per-meeting
/// forwarder.
async fn handle_inbound_frame(
    state: &GatewayState,
    ctx: &Arc<ConnectionContext>,
    frame: Frame,
) -> Option<Frame> {
    let correlation_id = frame.correlation_id.clone();
    let result = dispatch(state, ctx, &frame).await;
    match result {
        Ok(DispatchOutcome::Ack(payload)) => {
            Some(Frame::ack(&frame.event, correlation_id, payload))
        }
        Ok(DispatchOutcome::NoReply) => None,
        Err(err) => Some(Frame::error(correlation_id, &err)),
    }
}

enum DispatchOutcome {
    Ack(serde_json::Value),
    NoReply,
}

async fn dispatch(
    state: &GatewayState,
    ctx: &Arc<ConnectionContext>,
    frame: &Frame,
) -> Result<DispatchOutcome, ControlPlaneError> {
    match frame.event.as_str() {
        "join-main" => {
            let r: MeetingRef = parse(frame)?;
            ctx.join_room(&state.rooms, main_room(r.meeting_id)).await;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "join-waiting" => {
            let r: MeetingRef = parse(frame)?;
            ctx.join_room(&state.rooms, waiting_room(r.meeting_id)).await;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "host-join" => {
            let r: MeetingRef = parse(frame)?;
            ctx.join_room(&state.rooms, host_room(r.meeting_id)).await;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "leave-main" => {
            let r: MeetingRef = parse(frame)?;
            ctx.leave_room(&state.rooms, &main_room(r.meeting_id)).await;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "leave-waiting" => {
            let r: MeetingRef = parse(frame)?;
            ctx.leave_room(&state.rooms, &waiting_room(r.meeting_id)).await;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }

        "join" => handle_join(state, ctx, frame).await,
        "approve" => {
            let r: ParticipantRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .approve(ctx.principal.user_id, ctx.principal.system_role, r.participant_id)
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "reject" => {
            let r: RejectPayload = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .reject(
                    ctx.principal.user_id,
                    ctx.principal.system_role,
                    r.participant_id,
                    r.reason,
                )
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "admit-all" => {
            let r: MeetingRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            let count = handle
                .admit_all(ctx.principal.user_id, ctx.principal.system_role)
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::json!({ "admitted": count })))
        }
        "leave" => {
            let r: ParticipantRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle.leave(r.participant_id).await?;
            ctx.participants.lock().await.remove(&r.meeting_id);
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "kick" => {
            let r: KickPayload = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .kick(
                    ctx.principal.user_id,
                    ctx.principal.system_role,
                    r.target_participant_id,
                )
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "heartbeat" => {
            let r: ParticipantRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle.heartbeat(r.participant_id).await;
            Ok(DispatchOutcome::NoReply)
        }
        "force-mute" => {
            let r: ForceMutePayload = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .force_mute(
                    ctx.principal.user_id,
                    ctx.principal.system_role,
                    r.target_participant_id,
                    r.track,
                )
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "force-screen-share" => {
            let r: ForceScreenSharePayload = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .force_screen_share_control(
                    ctx.principal.user_id,
                    ctx.principal.system_role,
                    r.target_participant_id,
                    r.intent,
                )
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "transfer-host" => {
            let r: TransferHostPayload = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            let new_role: SystemRole = r.new_host_system_role.parse()?;
            let outcome = handle
                .transfer_host(
                    ctx.principal.user_id,
                    ctx.principal.system_role,
                    r.new_host_participant_id,
                    new_role,
                )
                .await?;
            // The new host needs a fresh SFU token minted under their
            // elevated role (§4.5, §4.6); delivered as the ack payload
            // rather than a room broadcast since only they should see it.
            let sfu_token = state.sfu_tokens.mint(
                &r.meeting_id.to_string(),
                &outcome
                    .new_host_user_id
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| outcome.new_host_participant_id.to_string()),
                &outcome.new_host_display_name,
                crate::domain::ParticipantRole::Host,
            );
            Ok(DispatchOutcome::Ack(serde_json::json!({
                "newHostParticipantId": outcome.new_host_participant_id,
                "sfuToken": sfu_token.ok(),
            })))
        }
        "lock-room" => {
            let r: MeetingRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .lock_room(ctx.principal.user_id, ctx.principal.system_role)
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "unlock-room" => {
            let r: MeetingRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .unlock_room(ctx.principal.user_id, ctx.principal.system_role)
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "start-meeting" => {
            let r: MeetingRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .start_meeting(ctx.principal.user_id, ctx.principal.system_role)
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "end-meeting" => {
            let r: MeetingRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .end_meeting(ctx.principal.user_id, ctx.principal.system_role)
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "rotate-invite-code" => {
            let r: MeetingRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            let code = handle
                .rotate_invite_code(ctx.principal.user_id, ctx.principal.system_role)
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::json!({ "inviteCode": code })))
        }

        "raise-hand" => {
            let r: MeetingRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .raise_hand(ctx.principal.user_id, ctx.principal.display_name.clone())
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "lower-hand" => {
            let r: MeetingRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .lower_hand(ctx.principal.user_id, LowerReason::SelfLowered)
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "host-lower-hand" => {
            let r: HostLowerHandPayload = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .host_lower_hand(
                    ctx.principal.user_id,
                    ctx.principal.system_role,
                    r.target_user_id,
                )
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "lower-all-hands" => {
            let r: MeetingRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .lower_all_hands(ctx.principal.user_id, ctx.principal.system_role)
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::Value::Null))
        }
        "list-raised-hands" => {
            let r: MeetingRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            let hands = handle.list_raised_hands().await;
            Ok(DispatchOutcome::Ack(serde_json::json!({ "raisedHands": hands })))
        }

        "chat-message" => {
            let r: ChatMessagePayload = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            handle
                .chat_message(ctx.principal.user_id, ctx.principal.display_name.clone(), r.text)
                .await;
            Ok(DispatchOutcome::NoReply)
        }

        "create-meeting" => {
            let r: CreateMeetingPayload = parse(frame)?;
            let meeting = state
                .controller
                .create_meeting(
                    r.title,
                    r.privacy_private,
                    ctx.principal.user_id,
                    r.scheduled_for,
                )
                .await?;
            Ok(DispatchOutcome::Ack(serde_json::to_value(meeting).unwrap_or_default()))
        }
        "list-meetings" => {
            let meetings = state.controller.list_meetings().await;
            Ok(DispatchOutcome::Ack(serde_json::to_value(meetings).unwrap_or_default()))
        }
        "resolve-invite-code" => {
            let r: ResolveInviteCodePayload = parse(frame)?;
            let meeting = state.controller.resolve_by_invite_code(r.code).await?;
            Ok(DispatchOutcome::Ack(serde_json::to_value(meeting).unwrap_or_default()))
        }
        "fetch-attendance" => {
            let r: MeetingRef = parse(frame)?;
            let handle = meeting_handle(state, r.meeting_id).await?;
            let participants = handle.list_participants(None).await;
            Ok(DispatchOutcome::Ack(
                serde_json::to_value(participants).unwrap_or_default(),
            ))
        }

        other => Err(ControlPlaneError::BadRequest(format!("unknown event: {other}"))),
    }
}

async fn handle_join(
    state: &GatewayState,
    ctx: &Arc<ConnectionContext>,
    frame: &Frame,
) -> Result<DispatchOutcome, ControlPlaneError> {
    let r: JoinPayload = parse(frame)?;
    let handle = meeting_handle(state, r.meeting_id).await?;

    let is_requester_host_or_admin = match ctx.principal.system_role {
        SystemRole::Admin => true,
        _ => handle
            .get_state()
            .await
            .is_some_and(|s| s.meeting.current_host_id == ctx.principal.user_id),
    };

    let display_name = r.display_name.unwrap_or_else(|| ctx.principal.display_name.clone());
    let outcome = handle
        .join(
            Some(ctx.principal.user_id),
            display_name,
            r.invite_code,
            is_requester_host_or_admin,
            ctx.id.to_string(),
        )
        .await?;

    ctx.participants
        .lock()
        .await
        .insert(r.meeting_id, outcome.participant_id);
    ctx.join_room(&state.rooms, participant_room(outcome.participant_id))
        .await;
    if outcome.status.is_in_room() {
        ctx.join_room(&state.rooms, main_room(r.meeting_id)).await;
    } else {
        ctx.join_room(&state.rooms, waiting_room(r.meeting_id)).await;
    }

    Ok(DispatchOutcome::Ack(serde_json::json!({
        "participantId": outcome.participant_id,
        "status": outcome.status,
        "role": outcome.role,
    })))
}

/// Resolve a meeting's actor handle, spawning its event forwarder on first
/// use so its `OutboundEvent`s start reaching connected sockets.
async fn meeting_handle(
    state: &GatewayState,
    meeting_id: MeetingId,
) -> Result<MeetingActorHandle, ControlPlaneError> {
    let handle = state
        .controller
        .get_meeting_handle(meeting_id)
        .await
        .ok_or_else(|| ControlPlaneError::NotFound("meeting".to_string()))?;
    ensure_forwarder(state, meeting_id, &handle).await;
    Ok(handle)
}

/// Spawn a background task that subscribes once to a meeting's outbound
/// event stream and fans each event out to the rooms it targets. Only one
/// forwarder runs per meeting regardless of how many sockets join it.
async fn ensure_forwarder(state: &GatewayState, meeting_id: MeetingId, handle: &MeetingActorHandle) {
    {
        let mut forwarders = state.forwarders.lock().await;
        if !forwarders.insert(meeting_id) {
            return;
        }
    }

    let Some(mut receiver) = handle.subscribe().await else {
        state.forwarders.lock().await.remove(&meeting_id);
        return;
    };

    let rooms = state.rooms.clone();
    let forwarders = state.forwarders.clone();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    for (room, frame) in route_outbound(meeting_id, event) {
                        rooms.broadcast(&room, frame).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "mc.gateway", meeting_id = %meeting_id, skipped, "gateway forwarder lagged, some events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        forwarders.lock().await.remove(&meeting_id);
    });
}

/// Map one `OutboundEvent` to the room(s) and wire frame(s) it is
/// delivered as (§4.8 event taxonomy).
fn route_outbound(meeting_id: MeetingId, event: OutboundEvent) -> Vec<(String, Frame)> {
    let main = main_room(meeting_id);
    let waiting = waiting_room(meeting_id);
    let host = host_room(meeting_id);

    let single = |room: String, wire_event: &str, payload: serde_json::Value| {
        vec![(room, Frame::ack(wire_event, None, payload))]
    };

    match event {
        OutboundEvent::PresenceUserJoined { participant } => single(
            main,
            "presence.user-joined",
            serde_json::json!({ "participant": participant }),
        ),
        OutboundEvent::PresenceUserLeft { participant_id } => single(
            main,
            "presence.user-left",
            serde_json::json!({ "participantId": participant_id }),
        ),
        OutboundEvent::PresenceHeartbeatAck { participant_id } => single(
            participant_room(participant_id),
            "presence.heartbeat-ack",
            serde_json::Value::Null,
        ),
        OutboundEvent::AdmissionParticipantWaiting { participant } => {
            let frame = Frame::ack(
                "admission.participant-waiting",
                None,
                serde_json::json!({ "participant": participant }),
            );
            vec![(waiting, frame.clone()), (host, frame)]
        }
        OutboundEvent::AdmissionParticipantApproved { participant_id } => single(
            main,
            "admission.participant-approved",
            serde_json::json!({ "participantId": participant_id }),
        ),
        OutboundEvent::AdmissionParticipantRejected { participant_id, reason } => single(
            waiting,
            "admission.participant-rejected",
            serde_json::json!({ "participantId": participant_id, "reason": reason }),
        ),
        OutboundEvent::AdmissionParticipantAdmitted { participant } => single(
            main,
            "admission.participant-admitted",
            serde_json::json!({ "participant": participant }),
        ),
        OutboundEvent::AdmissionAllAdmitted { participant_ids } => single(
            main,
            "admission.participant-admitted",
            serde_json::json!({ "participantIds": participant_ids }),
        ),
        OutboundEvent::AdmissionMeetingStarted => {
            single(waiting, "admission.meeting-started", serde_json::Value::Null)
        }
        OutboundEvent::AdmissionMeetingEnded => {
            single(main, "admission.meeting-ended", serde_json::Value::Null)
        }
        OutboundEvent::AdmissionRoomLocked => {
            single(main, "admission.room-locked", serde_json::Value::Null)
        }
        OutboundEvent::AdmissionRoomUnlocked => {
            single(main, "admission.room-unlocked", serde_json::Value::Null)
        }
        OutboundEvent::ModeratorForceMuted { participant_id, track } => {
            let wire_event = match track {
                MediaTrack::Mic => "moderator.force-muted",
                MediaTrack::Camera => "moderator.force-camera-off",
            };
            single(
                main,
                wire_event,
                serde_json::json!({ "participantId": participant_id, "track": track }),
            )
        }
        OutboundEvent::ModeratorScreenShareChanged { participant_id, intent } => single(
            main,
            "moderator.screen-share-changed",
            serde_json::json!({ "participantId": participant_id, "intent": intent }),
        ),
        OutboundEvent::ModeratorHostTransferred {
            new_host_participant_id,
            previous_host_participant_id,
        } => single(
            main,
            "moderator.host-transferred",
            serde_json::json!({
                "newHostParticipantId": new_host_participant_id,
                "previousHostParticipantId": previous_host_participant_id,
            }),
        ),
        OutboundEvent::ModeratorKicked { participant_id } => single(
            main,
            "moderator.kicked",
            serde_json::json!({ "participantId": participant_id }),
        ),
        OutboundEvent::HandRaised { user_id, display_name } => single(
            main,
            "hand.raised",
            serde_json::json!({ "userId": user_id, "displayName": display_name }),
        ),
        OutboundEvent::HandLowered { user_id } => {
            single(main, "hand.lowered", serde_json::json!({ "userId": user_id }))
        }
        OutboundEvent::HandAutoLowered { user_id } => single(
            main,
            "hand.auto-lowered",
            serde_json::json!({ "userId": user_id }),
        ),
        OutboundEvent::HandLoweredByHost { user_id } => single(
            main,
            "hand.lowered-by-host",
            serde_json::json!({ "userId": user_id }),
        ),
        OutboundEvent::HandAllLowered => {
            single(main, "hand.all-lowered", serde_json::Value::Null)
        }
        OutboundEvent::ChatMessage {
            from_user_id,
            display_name,
            text,
        } => single(
            main,
            "chat.message",
            serde_json::json!({
                "fromUserId": from_user_id,
                "displayName": display_name,
                "text": text,
            }),
        ),
    }
}

fn parse<T: serde::de::DeserializeOwned>(frame: &Frame) -> Result<T, ControlPlaneError> {
    serde_json::from_value(frame.payload.clone())
        .map_err(|e| ControlPlaneError::BadRequest(format!("malformed payload for {}: {e}", frame.event)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeetingRef {
    meeting_id: MeetingId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinPayload {
    meeting_id: MeetingId,
    invite_code: Option<String>,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantRef {
    meeting_id: MeetingId,
    participant_id: ParticipantId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RejectPayload {
    meeting_id: MeetingId,
    participant_id: ParticipantId,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KickPayload {
    meeting_id: MeetingId,
    target_participant_id: ParticipantId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceMutePayload {
    meeting_id: MeetingId,
    target_participant_id: ParticipantId,
    track: MediaTrack,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceScreenSharePayload {
    meeting_id: MeetingId,
    target_participant_id: ParticipantId,
    intent: MediaIntent,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferHostPayload {
    meeting_id: MeetingId,
    new_host_participant_id: ParticipantId,
    new_host_system_role: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostLowerHandPayload {
    meeting_id: MeetingId,
    target_user_id: UserId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessagePayload {
    meeting_id: MeetingId,
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMeetingPayload {
    title: String,
    privacy_private: bool,
    scheduled_for: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveInviteCodePayload {
    code: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_json() {
        let frame = Frame {
            event: "join".to_string(),
            payload: serde_json::json!({ "meetingId": MeetingId::new() }),
            correlation_id: Some("abc-123".to_string()),
            request_room: None,
        };
        let json = serde_json::to_string(&frame).expect("serialize");
        let back: Frame = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.event, "join");
        assert_eq!(back.correlation_id, Some("abc-123".to_string()));
    }

    #[test]
    fn frame_without_correlation_id_omits_the_field() {
        let frame = Frame::ack("heartbeat", None, serde_json::Value::Null);
        let json = serde_json::to_string(&frame).expect("serialize");
        assert!(!json.contains("correlationId"));
    }

    #[test]
    fn error_frame_hides_internal_detail() {
        let err = ControlPlaneError::Store("connection refused".to_string());
        let frame = Frame::error(Some("xyz".to_string()), &err);
        assert_eq!(frame.event, "error");
        assert_eq!(frame.payload["message"], "an internal error occurred");
        assert_eq!(frame.correlation_id, Some("xyz".to_string()));
    }

    #[test]
    fn room_names_are_namespaced_per_meeting() {
        let meeting_id = MeetingId::new();
        assert_eq!(main_room(meeting_id), meeting_id.to_string());
        assert!(waiting_room(meeting_id).starts_with("waiting:"));
        assert!(host_room(meeting_id).starts_with("host:"));
    }

    #[tokio::test]
    async fn room_registry_join_broadcast_leave() {
        let registry = RoomRegistry::default();
        let conn_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        registry.join("room-a", conn_id, tx).await;

        registry
            .broadcast("room-a", Frame::ack("test", None, serde_json::Value::Null))
            .await;
        let received = rx.recv().await.expect("should receive broadcast frame");
        assert_eq!(received.event, "test");

        registry.leave("room-a", conn_id).await;
        registry
            .broadcast("room-a", Frame::ack("test2", None, serde_json::Value::Null))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn route_outbound_fans_waiting_admission_to_two_rooms() {
        use crate::domain::{MediaIntent as _Unused, ParticipantRole, ParticipantStatus};

        let meeting_id = MeetingId::new();
        let participant = crate::domain::Participant {
            id: ParticipantId::new(),
            meeting_id,
            user_id: Some(UserId::new()),
            created_at: chrono::Utc::now(),
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
            last_seen_at: chrono::Utc::now(),
            sessions: vec![],
            total_duration_sec: 0,
        };

        let routed = route_outbound(
            meeting_id,
            OutboundEvent::AdmissionParticipantWaiting { participant },
        );
        assert_eq!(routed.len(), 2);
        assert_eq!(routed[0].0, waiting_room(meeting_id));
        assert_eq!(routed[1].0, host_room(meeting_id));
    }

    #[test]
    fn route_outbound_distinguishes_mic_and_camera_force_mute() {
        let meeting_id = MeetingId::new();
        let participant_id = ParticipantId::new();

        let mic = route_outbound(
            meeting_id,
            OutboundEvent::ModeratorForceMuted {
                participant_id,
                track: MediaTrack::Mic,
            },
        );
        assert_eq!(mic[0].1.event, "moderator.force-muted");

        let camera = route_outbound(
            meeting_id,
            OutboundEvent::ModeratorForceMuted {
                participant_id,
                track: MediaTrack::Camera,
            },
        );
        assert_eq!(camera[0].1.event, "moderator.force-camera-off");
    }
}
