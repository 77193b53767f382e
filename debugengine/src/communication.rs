/// Command/response correlation for the backend link
///
/// This module assigns tokens to outgoing commands, tracks the commands
/// that are still in flight and turns decoded backend blocks into typed
/// `Response` values in the order the backend emitted them.

use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::commands::{Command, Continuation};
use crate::parser::{decode_block, FrameDecoder};
use crate::types::Value;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("backend link is closed, cannot send {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// A command that was written to the backend and not yet answered.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub token: u64,
    pub name: String,
    pub payload: String,
    pub continuation: Option<Continuation>,
}

/// One top-level field of a backend block, keyed by its tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Data(Value),
    Stack(Value),
    StackPosition(Value),
    StackTop(Value),
    Registers(Value),
    Threads(Value),
    TypeInfo(Value),
    State(String),
    Location(Value),
    Modules(Value),
    Symbols(Value),
    BreakpointAdded(Value),
    BreakpointChanged(Value),
    BreakpointRemoved(Value),
    Output(Value),
    Disassembly(Value),
    Memory(Value),
    Continuation(String),
    StatusMessage(String),
    FullBacktrace(Value),
    Pid(Value),
}

impl Response {
    /// Map a tag to its response kind. Unknown tags yield `None`.
    pub fn from_field(name: &str, value: Value) -> Option<Self> {
        let response = match name {
            "data" => Response::Data(value),
            "stack" => Response::Stack(value),
            "stack-position" => Response::StackPosition(value),
            "stack-top" => Response::StackTop(value),
            "registers" => Response::Registers(value),
            "threads" => Response::Threads(value),
            "typeinfo" => Response::TypeInfo(value),
            "state" => Response::State(value.data().to_string()),
            "location" => Response::Location(value),
            "modules" => Response::Modules(value),
            "symbols" => Response::Symbols(value),
            "breakpoint-added" => Response::BreakpointAdded(value),
            "breakpoint-changed" => Response::BreakpointChanged(value),
            "breakpoint-removed" => Response::BreakpointRemoved(value),
            "output" => Response::Output(value),
            "disassembly" => Response::Disassembly(value),
            "memory" => Response::Memory(value),
            "continuation" => Response::Continuation(value.data().to_string()),
            "statusmessage" => Response::StatusMessage(value.data().to_string()),
            "full-backtrace" => Response::FullBacktrace(value),
            "pid" => Response::Pid(value),
            _ => return None,
        };
        Some(response)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Response::Data(_) => "data",
            Response::Stack(_) => "stack",
            Response::StackPosition(_) => "stack-position",
            Response::StackTop(_) => "stack-top",
            Response::Registers(_) => "registers",
            Response::Threads(_) => "threads",
            Response::TypeInfo(_) => "typeinfo",
            Response::State(_) => "state",
            Response::Location(_) => "location",
            Response::Modules(_) => "modules",
            Response::Symbols(_) => "symbols",
            Response::BreakpointAdded(_) => "breakpoint-added",
            Response::BreakpointChanged(_) => "breakpoint-changed",
            Response::BreakpointRemoved(_) => "breakpoint-removed",
            Response::Output(_) => "output",
            Response::Disassembly(_) => "disassembly",
            Response::Memory(_) => "memory",
            Response::Continuation(_) => "continuation",
            Response::StatusMessage(_) => "statusmessage",
            Response::FullBacktrace(_) => "full-backtrace",
            Response::Pid(_) => "pid",
        }
    }
}

/// Owns the outbound half of the backend link.
pub struct Correlator {
    last_token: u64,
    pending: BTreeMap<u64, PendingCommand>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    decoder: FrameDecoder,
}

impl Correlator {
    pub fn new(outbound: mpsc::UnboundedSender<String>, terminator: &str) -> Self {
        Self {
            last_token: 0,
            pending: BTreeMap::new(),
            outbound: Some(outbound),
            decoder: FrameDecoder::new(terminator),
        }
    }

    /// Assign the next token and write the command. The token is consumed
    /// even when the write fails, so tokens are never reused.
    pub fn send(&mut self, command: Command) -> Result<u64> {
        self.last_token += 1;
        let token = self.last_token;
        let line = command.encode(token);

        let Some(outbound) = self.outbound.as_ref() else {
            log::warn!("SEND[{}]: link closed, dropping {}", token, command.function());
            return Err(LinkError::Closed(command.function().to_string()));
        };

        log::debug!("SEND[{}]: {}", token, line.trim_end());
        if outbound.send(line).is_err() {
            log::warn!("SEND[{}]: backend writer is gone", token);
            self.outbound = None;
            return Err(LinkError::Closed(command.function().to_string()));
        }

        self.pending.insert(
            token,
            PendingCommand {
                token,
                name: command.function().to_string(),
                payload: command.payload(),
                continuation: command.continuation(),
            },
        );
        Ok(token)
    }

    /// Feed raw backend output. Returns the responses of every block the
    /// chunk completed; malformed blocks are logged and dropped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Response> {
        let mut responses = Vec::new();

        for block in self.decoder.push(bytes) {
            log::debug!("RECV: {}", block);
            let decoded = match decode_block(&block) {
                Ok(decoded) => decoded,
                Err(e) => {
                    log::warn!("RECV: dropping malformed block '{}': {}", block, e);
                    continue;
                }
            };

            if let Some(token) = decoded.token() {
                match self.retire(token) {
                    Some(command) => log::debug!("RECV[{}]: answers {}", token, command.name),
                    None => log::warn!("RECV[{}]: no pending command for token", token),
                }
            }

            for (name, value) in decoded.items {
                if name == "token" {
                    continue;
                }
                match Response::from_field(&name, value) {
                    Some(response) => responses.push(response),
                    None => log::debug!("RECV: ignoring unknown tag '{}'", name),
                }
            }
        }

        responses
    }

    pub fn retire(&mut self, token: u64) -> Option<PendingCommand> {
        self.pending.remove(&token)
    }

    /// Drop every in-flight command, oldest first.
    pub fn retire_all(&mut self) -> Vec<PendingCommand> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Close the outbound channel. The process writer treats this as the
    /// signal to stop the backend.
    pub fn close(&mut self) {
        if self.outbound.take().is_some() {
            log::debug!("Closing backend link");
        }
        self.decoder.clear();
    }

    /// Attach a fresh outbound channel, keeping the token sequence.
    pub fn reconnect(&mut self, outbound: mpsc::UnboundedSender<String>) {
        log::debug!("Reconnecting backend link after token {}", self.last_token);
        self.outbound = Some(outbound);
        self.decoder.clear();
    }

    pub fn is_open(&self) -> bool {
        self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingCommand> {
        self.pending.values()
    }

    pub fn last_token(&self) -> u64 {
        self.last_token
    }
}
