/// Debugger session controller
///
/// This crate drives an external debugger backend through the lifecycle
/// of a debugging session: engine setup, inferior setup, the run/stop
/// cycle, breakpoint synchronization and shutdown. The backend is a
/// separate process speaking a line-oriented JSON command protocol.

use thiserror::Error;

pub mod backend;
pub mod breakpoints;
pub mod commands;
pub mod communication;
pub mod config;
pub mod engine;
pub mod events;
pub mod parser;
pub mod process;
pub mod session;
pub mod sinks;
pub mod state;
pub mod types;

pub use backend::{Backend, BridgeBackend, Capabilities, ExecCommand};
pub use breakpoints::{BreakHandler, BreakpointId, BreakpointLocation, BreakpointParameters, SharedBreakHandler};
pub use config::SessionConfig;
pub use engine::{DebuggerEngine, DeferredStep};
pub use events::{EventSink, FailureKind, Location, OutputChannel, SessionEvent};
pub use session::{apply_request, run_event_loop, spawn_backend, SessionRequest};
pub use state::SessionState;
pub use types::*;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{operation} is not possible in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("Communication error: {0}")]
    Link(#[from] communication::LinkError),
    #[error("Failed to parse backend output: {0}")]
    Decode(#[from] parser::DecodeError),
    #[error("Breakpoint error: {0}")]
    Breakpoint(#[from] breakpoints::BreakpointError),
    #[error("Backend does not support {0:?}")]
    Unsupported(Capabilities),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("Failed to start backend process: {0}")]
    ProcessStartError(#[from] std::io::Error),
    #[error(transparent)]
    Process(#[from] process::ProcessError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
