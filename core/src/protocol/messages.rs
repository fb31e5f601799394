//! Protocol message definitions
//!
//! Every frame on the wire carries a [`Message`] envelope whose `content` is
//! one of the type-specific bodies below, itself protobuf-encoded. The
//! definitions mirror the proto2 schema shared with the other cellaserv
//! clients, so field tags must never change.

use bytes::Bytes;

/// Outer envelope of every frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", required, tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "bytes", required, tag = "2")]
    pub content: Bytes,
}

/// Discriminant of [`Message::content`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Register = 0,
    Request = 1,
    Reply = 2,
    Subscribe = 3,
    Publish = 4,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Register => "Register",
            MessageType::Request => "Request",
            MessageType::Reply => "Reply",
            MessageType::Subscribe => "Subscribe",
            MessageType::Publish => "Publish",
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Register {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(string, optional, tag = "2")]
    pub identification: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(string, required, tag = "1")]
    pub service_name: String,
    #[prost(string, optional, tag = "2")]
    pub service_identification: Option<String>,
    #[prost(string, required, tag = "3")]
    pub method: String,
    #[prost(bytes = "bytes", optional, tag = "4")]
    pub data: Option<Bytes>,
    #[prost(uint64, required, tag = "5")]
    pub id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reply {
    #[prost(message, optional, tag = "1")]
    pub error: Option<ReplyError>,
    #[prost(uint64, required, tag = "2")]
    pub id: u64,
    #[prost(bytes = "bytes", optional, tag = "3")]
    pub data: Option<Bytes>,
}

/// Error carried by a [`Reply`] instead of data.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplyError {
    #[prost(enumeration = "ErrorType", required, tag = "1")]
    pub r#type: i32,
    #[prost(string, optional, tag = "2")]
    pub what: Option<String>,
}

/// Request-level errors reported back to the caller as a [`Reply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorType {
    NoSuchService = 1,
    InvalidIdentification = 2,
    NoSuchMethod = 3,
    BadArguments = 4,
    Timeout = 5,
    Custom = 6,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorType::NoSuchService => "NoSuchService",
            ErrorType::InvalidIdentification => "InvalidIdentification",
            ErrorType::NoSuchMethod => "NoSuchMethod",
            ErrorType::BadArguments => "BadArguments",
            ErrorType::Timeout => "Timeout",
            ErrorType::Custom => "Custom",
        };
        f.write_str(name)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Subscribe {
    #[prost(string, required, tag = "1")]
    pub event: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Publish {
    #[prost(string, required, tag = "1")]
    pub event: String,
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub data: Option<Bytes>,
}

/// Record stored by the packet dumper for every captured frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogMessage {
    #[prost(string, required, tag = "1")]
    pub sender: String,
    #[prost(bytes = "bytes", required, tag = "2")]
    pub content: Bytes,
}
