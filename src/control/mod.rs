//! Streaming Control Channel
//!
//! The protocol surface of the orchestrator: a duplex stream over which a
//! caller starts, resumes, pauses or polls a task and receives its results.

pub mod channel;
pub mod codec;
pub mod messages;

pub use channel::ControlChannel;
pub use codec::{decode_line, encode_line, serve_lines};
pub use messages::{ControlMessage, ControlMode, ExecResult, ScanResponse, UnitStatus};
