//! The actor layer (§3, §5): a singleton registry actor plus one
//! `MeetingActor` per live meeting.

pub mod controller;
pub mod meeting;
pub mod messages;
pub mod metrics;
