//! Meeting Controller
//!
//! The classroom control plane: meeting registry, presence/session
//! tracking, the waiting-room admission state machine, moderator
//! controls, the hand-raise engine, and the realtime WebSocket gateway
//! that fronts all of it. Also mints short-lived access tokens for the
//! external SFU and verifies bearer credentials issued by the external
//! Identity Provider.
//!
//! # Architecture
//!
//! One [`actors::controller`] registry actor per process owns the map
//! from meeting id to a running [`actors::meeting`] actor. Each meeting
//! actor serializes every admission, presence, moderator, and hand-raise
//! operation for that meeting through its mailbox, giving a total order
//! per meeting without a distributed lock.
//!
//! ```text
//! ControllerActor (singleton per process)
//! └── owns N MeetingActorHandles
//!     └── MeetingActor (one per live meeting)
//!         ├── owns participant/session/hand-raise state
//!         └── broadcasts OutboundEvent to the gateway's room fanout
//! ```
//!
//! # Modules
//!
//! - [`actors`] - the registry and per-meeting actors and their message types
//! - [`config`] - service configuration from environment
//! - [`domain`] - the meeting/participant/session/raised-hand data model
//! - [`errors`] - error types with stable, wire-safe error codes
//! - [`gateway`] - the authenticated realtime WebSocket bus (§4.8)
//! - [`identity`] - bearer credential verification (Identity Provider)
//! - [`jwks`] - JWKS client for the Identity Provider's signing keys
//! - [`observability`] - health/readiness probes and admin HTTP endpoints
//! - [`recordings`] - the `RecordingStore` boundary to the external FileStore
//! - [`sfu_token`] - SFU access token minting
//! - [`store`] - the `Store` trait and its Postgres/in-memory implementations

pub mod actors;
pub mod config;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod identity;
pub mod jwks;
pub mod observability;
pub mod recordings;
pub mod sfu_token;
pub mod store;
