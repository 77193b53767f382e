/// Session event loop
///
/// One cooperative loop per engine. Each iteration first drains the
/// deferred-step queue, then waits for the next backend event, client
/// request or ping tick. Nothing here runs on another thread; the backend
/// pipes are pumped by the tasks `process` spawns.

use std::time::Duration;
use tokio::sync::mpsc;

use crate::breakpoints::{BreakpointId, BreakpointParameters};
use crate::config::SessionConfig;
use crate::engine::DebuggerEngine;
use crate::process::{BackendEvent, BackendProcess};
use crate::state::SessionState;
use crate::types::SessionParameters;
use crate::Result;

const PING_INTERVAL: Duration = Duration::from_millis(500);

/// Everything a client can ask of a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionRequest {
    Run,
    Continue,
    Step,
    StepInstruction,
    Next,
    NextInstruction,
    StepOut,
    RunToLine { file: String, line: u32 },
    RunToFunction(String),
    JumpToLine { file: String, line: u32 },
    Interrupt,
    Shutdown,
    Abort,
    /// Start a new session once the previous one finished.
    Restart,

    InsertBreakpoint(BreakpointParameters),
    ChangeBreakpoint(BreakpointId, BreakpointParameters),
    RemoveBreakpoint(BreakpointId),

    ActivateFrame(usize),
    SelectThread(String),
    ReloadRegisters,
    ReloadModules,
    ReloadFullStack,
    ModuleSymbols(String),
    AddWatcher(String),
    RemoveWatcher(String),
    AssignValue { expression: String, value: String },
    SetRegister { name: String, value: String },
    Disassemble { address: u64, function: String },
    FetchMemory { address: u64, length: u64 },
    FullBacktrace,
    DebuggerCommand(String),
}

/// Apply one client request to `engine`.
pub fn apply_request(engine: &mut DebuggerEngine, request: SessionRequest) -> Result<()> {
    log::debug!("Client request: {:?}", request);
    match request {
        SessionRequest::Run => engine.request_run(),
        SessionRequest::Continue => engine.request_continue(),
        SessionRequest::Step => engine.request_step(),
        SessionRequest::StepInstruction => engine.request_step_instruction(),
        SessionRequest::Next => engine.request_next(),
        SessionRequest::NextInstruction => engine.request_next_instruction(),
        SessionRequest::StepOut => engine.request_step_out(),
        SessionRequest::RunToLine { file, line } => engine.request_run_to_line(&file, line, 0),
        SessionRequest::RunToFunction(function) => engine.request_run_to_function(&function),
        SessionRequest::JumpToLine { file, line } => engine.request_jump_to_line(&file, line, 0),
        SessionRequest::Interrupt => engine.request_interrupt(),
        SessionRequest::Shutdown => {
            engine.request_shutdown();
            Ok(())
        }
        SessionRequest::Abort => {
            engine.abort();
            Ok(())
        }
        SessionRequest::Restart => {
            let params = engine.params().clone();
            engine.start_setup(params)
        }
        SessionRequest::InsertBreakpoint(params) => {
            let id = engine.breakpoints().lock().insert(params);
            log::info!("Breakpoint {} added", id);
            engine.request_breakpoint_synchronization();
            Ok(())
        }
        SessionRequest::ChangeBreakpoint(id, params) => {
            engine.breakpoints().lock().change(&id, params)?;
            engine.request_breakpoint_synchronization();
            Ok(())
        }
        SessionRequest::RemoveBreakpoint(id) => {
            engine.breakpoints().lock().remove(&id)?;
            engine.request_breakpoint_synchronization();
            Ok(())
        }
        SessionRequest::ActivateFrame(index) => engine.activate_frame(index),
        SessionRequest::SelectThread(id) => engine.select_thread(&id),
        SessionRequest::ReloadRegisters => engine.reload_registers(),
        SessionRequest::ReloadModules => engine.reload_modules(),
        SessionRequest::ReloadFullStack => engine.reload_full_stack(),
        SessionRequest::ModuleSymbols(module) => engine.request_module_symbols(&module),
        SessionRequest::AddWatcher(expression) => engine.add_watcher(&expression).map(|_| ()),
        SessionRequest::RemoveWatcher(iname) => {
            engine.remove_watcher(&iname);
            Ok(())
        }
        SessionRequest::AssignValue { expression, value } => engine.assign_value(&expression, &value),
        SessionRequest::SetRegister { name, value } => engine.set_register_value(&name, &value),
        SessionRequest::Disassemble { address, function } => {
            engine.fetch_disassembler(address, &function).map(|_| ())
        }
        SessionRequest::FetchMemory { address, length } => engine.fetch_memory(address, length).map(|_| ()),
        SessionRequest::FullBacktrace => engine.create_full_backtrace(),
        SessionRequest::DebuggerCommand(command) => engine.execute_debugger_command(&command),
    }
}

/// Spawn the configured backend and connect it to fresh channels. Returns
/// the outbound sender for the engine's link and the backend event stream.
pub fn spawn_backend(
    config: &SessionConfig,
    params: &SessionParameters,
) -> Result<(mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<BackendEvent>)> {
    let process = BackendProcess::start(&config.backend_command, &config.backend_args, params)?;
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    process.attach(outbound_rx, events_tx)?;
    Ok((outbound_tx, events_rx))
}

fn dispatch_backend_event(engine: &mut DebuggerEngine, event: BackendEvent) {
    match event {
        BackendEvent::Output(bytes) => engine.handle_backend_output(&bytes),
        BackendEvent::Stderr(text) => engine.handle_backend_stderr(&text),
        BackendEvent::Exited(code) => engine.handle_backend_exited(code),
        BackendEvent::Error(message) => engine.handle_backend_error(&message),
    }
}

/// Drive `engine` until the session reaches `Finished`. A closed request
/// channel is treated as a shutdown request. Call after `start_setup`.
pub async fn run_event_loop(
    engine: &mut DebuggerEngine,
    backend: &mut mpsc::UnboundedReceiver<BackendEvent>,
    requests: &mut mpsc::UnboundedReceiver<SessionRequest>,
) -> SessionState {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    let mut backend_open = true;
    let mut requests_open = true;

    loop {
        while engine.has_deferred_work() {
            engine.run_deferred();
        }
        if engine.state() == SessionState::Finished {
            break;
        }

        tokio::select! {
            event = backend.recv(), if backend_open => match event {
                Some(event) => dispatch_backend_event(engine, event),
                None => {
                    log::debug!("Backend event stream closed");
                    backend_open = false;
                    engine.handle_backend_exited(None);
                }
            },
            request = requests.recv(), if requests_open => match request {
                Some(request) => {
                    if let Err(e) = apply_request(engine, request) {
                        log::warn!("Request failed: {}", e);
                    }
                }
                None => {
                    log::debug!("Client went away, shutting down");
                    requests_open = false;
                    engine.request_shutdown();
                }
            },
            _ = ping.tick() => engine.progress_ping(),
        }
    }

    log::info!("{} finished", engine.id());
    engine.state()
}
