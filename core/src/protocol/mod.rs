//! # Cellaserv Protocol Module
//!
//! Wire format shared by the broker and its clients.
//!
//! ## Framing
//!
//! ```text
//! Frame    => Length Envelope
//! Length   => uint32 (big-endian)
//! Envelope => Message { type, content }
//! ```
//!
//! `content` is the protobuf encoding of the body selected by `type`:
//!
//! - **Register**: `{name, identification?}` - claim a service name
//! - **Request**: `{service_name, service_identification?, method, data?, id}`
//! - **Reply**: `{id, data?}` or `{id, error}` - answer to a request
//! - **Subscribe**: `{event}` - exact name or glob pattern
//! - **Publish**: `{event, data?}` - fire-and-forget event
//!
//! ## Modules
//!
//! - [`messages`] - protobuf message definitions
//! - [`codec`] - length-prefix framing and envelope helpers

pub mod codec;
pub mod messages;

pub use codec::*;
pub use messages::*;
