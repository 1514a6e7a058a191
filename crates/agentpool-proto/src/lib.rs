//! Message protocol between the pool manager and its worker processes.
//!
//! Messages travel as one JSON document per line over the worker's
//! stdin (manager -> worker) and stdout (worker -> manager). Each task and
//! its result are correlated by task id, never by message id.
//!
//! This crate contains:
//! - The message envelope and payload types
//! - An async line codec over any `AsyncRead` / `AsyncWrite`

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{decode, encode, MessageReader, MessageWriter};
pub use error::ProtoError;
pub use message::{ControlCommand, Heartbeat, LogChunk, Message, Payload, Ready, WorkerFault};
