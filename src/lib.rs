//! skein - agent thread runtime.
//!
//! The core of an AI-assisted developer CLI: a provider-agnostic exchange
//! loop that streams model output, executes tool calls concurrently against
//! local state, and persists a resumable transcript after every exchange.
//!
//! - [`Thread`] runs the loop; [`Thread::send`] is the single entry point.
//! - [`provider::Provider`] abstracts the wire protocols (Anthropic
//!   Messages, OpenAI Chat Completions, OpenAI Responses).
//! - [`tools::ToolRegistry`] advertises and validates tools; results are
//!   structured [`tools::StructuredToolResult`] values.
//! - [`store::ConversationStore`] persists records (SQLite by default,
//!   file-per-record fallback).
//!
//! Concrete tool implementations, front-ends, and credential storage live
//! outside this crate; they consume the interfaces defined here.

#![forbid(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]

pub mod cancel;
pub mod compaction;
pub mod config;
pub mod error;
pub mod events;
pub mod headless;
pub mod hooks;
pub mod logging;
pub mod model;
pub mod models;
pub mod provider;
pub mod providers;
pub mod sse;
pub mod steer;
pub mod store;
pub mod store_json;
pub mod store_sqlite;
pub mod thread;
pub mod tools;

pub use cancel::{CancelHandle, CancelToken};
pub use error::{Error, Result};
pub use thread::{SendOptions, SendResult, Thread, ThreadConfig, ThreadState};
