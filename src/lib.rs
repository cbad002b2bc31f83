//! # chatd
//!
//! Wire types for the chatd multi-user chat service.
//!
//! This library provides the command codes, the pipe-delimited protocol record
//! with its length-prefixed framing, and the typed request variants shared by
//! the server and the debug client.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod request;

pub use error::{Error, Result};
pub use protocol::ProtocolMessage;
pub use request::Request;
