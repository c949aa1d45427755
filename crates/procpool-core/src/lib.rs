//! Core types and utilities for procpool.
//!
//! This crate provides the building blocks shared by the pool manager and the
//! worker processes it talks to:
//!
//! - **Identifiers**: strongly-typed worker and session IDs
//! - **Error taxonomy**: structured errors with a category, a kind and context
//! - **Wire protocol**: framed JSON request/response messages
//! - **Lifecycle**: the worker state machine and its transition table
//!
//! # Example
//!
//! ```
//! use procpool_core::lifecycle::{WorkerState, WorkerStateMachine};
//! use procpool_core::protocol::{MessageCodec, Request};
//!
//! let mut machine = WorkerStateMachine::new();
//! machine.transition(WorkerState::Ready, "init_complete", None).unwrap();
//! assert_eq!(machine.state(), WorkerState::Ready);
//!
//! let codec = MessageCodec::default();
//! let frame = codec.encode_frame(&Request::new(1, "ping", Default::default())).unwrap();
//! assert!(frame.ends_with(b"\n"));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod protocol;

pub use error::{ErrorCategory, ErrorKind, ErrorReport, PoolError, Result};
pub use ids::{IdError, SessionId, WorkerId};
pub use lifecycle::{
    TransitionError, TransitionRecord, WorkerHealth, WorkerState, WorkerStateMachine,
};
pub use protocol::{Framing, MessageCodec, ProtocolError, Request, Response};
