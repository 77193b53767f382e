/// Session events
///
/// Everything the surrounding application learns about a session goes
/// through `EventSink`: registered callbacks run first, then the event is
/// forwarded on the subscriber channel. The engine holds no reference back
/// into presentation code.

use tokio::sync::mpsc;

use crate::breakpoints::BreakpointId;
use crate::sinks::{DisassemblerLine, SinkKind, Symbol};
use crate::state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    AppOutput,
    AppError,
    AppStuff,
    DebuggerStderr,
    Backtrace,
}

/// Terminal conditions reported to the user, at most once each per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    EngineSetup,
    InferiorSetup,
    EngineRun,
    InferiorRun,
    InferiorStop,
    InferiorShutdown,
    EngineShutdown,
    EngineCrashed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::EngineSetup => "Setting up the debugger failed",
            FailureKind::InferiorSetup => "Setting up the inferior failed",
            FailureKind::EngineRun => "Running the debugger failed",
            FailureKind::InferiorRun => "Running the inferior failed",
            FailureKind::InferiorStop => "Stopping the inferior failed",
            FailureKind::InferiorShutdown => "Shutting down the inferior failed",
            FailureKind::EngineShutdown => "Shutting down the debugger failed",
            FailureKind::EngineCrashed => "The debugger exited unexpectedly",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub address: u64,
    pub file: String,
    pub line: i64,
    /// Show as disassembly rather than source.
    pub use_assembler: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
        forced: bool,
    },
    /// Views should refresh their enabled actions. Not sent by slave engines.
    ViewsUpdateRequested(SessionState),
    DataUpdated(SinkKind),
    BreakpointResponseChanged(BreakpointId),
    BreakpointReleased(BreakpointId),
    Disassembly {
        cookie: u64,
        lines: Vec<DisassemblerLine>,
    },
    Memory {
        cookie: u64,
        address: u64,
        contents: Vec<u8>,
    },
    ModuleSymbols {
        module: String,
        symbols: Vec<Symbol>,
    },
    Location(Location),
    Output {
        channel: OutputChannel,
        text: String,
    },
    StatusMessage(String),
    Failure(FailureKind),
    Progress(u32),
    InferiorPid(i64),
    Finished,
}

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Observer list plus an optional subscriber channel.
#[derive(Default)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<SessionEvent>>,
    state_change_callbacks: Vec<Callback<SessionState>>,
    data_callbacks: Vec<Callback<SinkKind>>,
    breakpoint_callbacks: Vec<Callback<BreakpointId>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the subscriber channel and return its receiving end.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.sender = Some(sender);
        receiver
    }

    /// Add state change callback
    pub fn on_state_changed<F>(&mut self, callback: F)
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.state_change_callbacks.push(Box::new(callback));
    }

    /// Add data update callback
    pub fn on_data_updated<F>(&mut self, callback: F)
    where
        F: Fn(&SinkKind) + Send + Sync + 'static,
    {
        self.data_callbacks.push(Box::new(callback));
    }

    /// Add breakpoint response callback
    pub fn on_breakpoint_response_changed<F>(&mut self, callback: F)
    where
        F: Fn(&BreakpointId) + Send + Sync + 'static,
    {
        self.breakpoint_callbacks.push(Box::new(callback));
    }

    pub fn emit(&mut self, event: SessionEvent) {
        match &event {
            SessionEvent::StateChanged { to, .. } => {
                for callback in &self.state_change_callbacks {
                    callback(to);
                }
            }
            SessionEvent::DataUpdated(kind) => {
                for callback in &self.data_callbacks {
                    callback(kind);
                }
            }
            SessionEvent::BreakpointResponseChanged(id) => {
                for callback in &self.breakpoint_callbacks {
                    callback(id);
                }
            }
            _ => {}
        }

        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                log::debug!("Event subscriber went away");
                self.sender = None;
            }
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("subscribed", &self.sender.is_some())
            .field("callbacks", &(self.state_change_callbacks.len() + self.data_callbacks.len() + self.breakpoint_callbacks.len()))
            .finish()
    }
}
