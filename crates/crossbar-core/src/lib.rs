//! # crossbar-core
//!
//! Wire-level message model and protocol building blocks shared by every
//! crossbar crate:
//!
//! - [`Envelope`] / [`Message`] / [`Verb`]: the JSON wire format
//! - [`MsgId`]: per-connection message identifiers with the send-and-forget
//!   sentinel
//! - [`Tracked`]: a single-assignment outcome whose settled state is
//!   observable without awaiting
//! - [`ConnectionSecret`]: the opaque reconnect identity token
//! - [`RoutePattern`]: `:name` route patterns compiled to regexes
//! - [`ProtocolConfig`]: every protocol timing constant in one place

#![deny(unsafe_code)]

pub mod config;
pub mod logging;
pub mod message;
pub mod pattern;
pub mod secret;
pub mod status;
pub mod tracked;

pub use config::ProtocolConfig;
pub use message::{Envelope, Message, MsgId, RouteReply, Verb};
pub use pattern::{PatternError, RouteMatch, RoutePattern};
pub use secret::ConnectionSecret;
pub use tracked::Tracked;
