//! SSH front end of the gateway.
//!
//! Authenticates Git clients, then runs each exec request through a
//! middleware pipeline whose git link authorizes the command against the
//! backend and hands the channel's streams to a protocol executor.

pub mod dispatch;
pub mod pipeline;
pub mod server;
pub mod session;

pub use dispatch::GitDispatch;
pub use pipeline::{LoggingMiddleware, Pipeline, UnsupportedCommand};
pub use server::{start_ssh_server, ActiveSessions};
