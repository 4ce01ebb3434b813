//! # Streamgate Gateway Library
//!
//! Spawns external processes and streams their I/O to HTTP clients in near
//! real time.
//!
//! ## Overview
//!
//! Every client request becomes one [`Session`] owning exactly one process:
//!
//! - **Interactive terminal**: a shell on a pseudo-terminal, bridged to a
//!   websocket in both directions, with live resize
//! - **One-shot exec**: a command whose stdout and stderr lines are streamed
//!   as NDJSON envelopes, ending with a completion envelope
//! - **Log follow**: a follow process whose lines are pushed as server-sent
//!   events
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     HTTP server (axum)                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────────────┐  │
//! │  │  terminal  │   │    exec    │   │        follow        │  │
//! │  │ (websocket)│   │  (NDJSON)  │   │        (SSE)         │  │
//! │  └─────┬──────┘   └─────┬──────┘   └──────────┬───────────┘  │
//! │        └────────────────┼─────────────────────┘              │
//! │                  ┌──────┴──────┐      ┌──────────────────┐   │
//! │                  │   Session   │──────│ Session registry │   │
//! │                  └──────┬──────┘      └──────────────────┘   │
//! │            ┌────────────┴────────────┐                       │
//! │     ┌──────┴──────┐           ┌──────┴──────┐                │
//! │     │    Pumps    │           │  Launcher   │                │
//! │     └─────────────┘           └─────────────┘                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gateway::{server, AppState, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let listener = server::bind(&config.server.bind).await?;
//!     server::serve(listener, AppState::new(config), server::shutdown_signal()).await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Process launcher, stream pumps, session lifecycle and registry
//! - [`transport`]: Websocket, NDJSON and event-stream adapters
//! - [`server`]: Router, handlers and graceful shutdown
//! - [`action_log`]: Bounded record of external command invocations
//! - [`runner`]: Buffered one-shot CLI invocations
//! - [`targets`]: Launch command templates

pub mod action_log;
pub mod config;
pub mod runner;
pub mod server;
pub mod session;
pub mod targets;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use action_log::{ActionLog, ActionLogEntry};
pub use config::Config;
pub use runner::{CommandOutput, CommandRunner, RunError};
pub use server::{ApiError, AppState};
pub use session::{
    CloseReason, Dimensions, LaunchError, LaunchErrorKind, LaunchSpec, Session, SessionError,
    SessionId, SessionLimits, SessionOutcome, SessionRegistry,
};
pub use targets::{TargetError, Targets};
