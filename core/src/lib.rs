//! Root of the `stepwise-core` library.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through events or the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod approval;
mod client;
pub use client::LlmClient;
mod client_common;
pub use client_common::LlmResponse;
pub use client_common::Prompt;
pub use client_common::ResponseEvent;
pub use client_common::ResponseStream;
pub mod config;
mod conversation_history;
pub mod error;
pub mod event_sink;
pub mod fixture_client;
pub mod flags;
pub mod models;
pub mod protocol;
pub mod safety;
mod session;
pub use session::Session;
pub use session::TurnOutcome;
pub mod tool_resolver;
pub mod tool_spec;
pub mod tools;
mod turn;
pub mod util;
