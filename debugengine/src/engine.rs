/// Session state machine
///
/// `DebuggerEngine` owns one backend link and walks it through setup, the
/// run/stop cycle and shutdown. Client requests and backend notifications
/// change the state immediately; every backend-facing follow-up call is
/// queued as a `DeferredStep` and runs on the next event loop tick.

use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc;

use crate::backend::{Backend, Capabilities, ExecCommand};
use crate::breakpoints::{batch_command, BreakpointOperation, SharedBreakHandler};
use crate::commands::{group, to_hex, Command, Continuation};
use crate::communication::{Correlator, Response};
use crate::config::SessionConfig;
use crate::events::{EventSink, FailureKind, Location, OutputChannel, SessionEvent};
use crate::sinks::{DataSinks, DisassemblerLine, SinkKind, StackFrame, Symbol};
use crate::state::{is_allowed_transition, SessionState};
use crate::types::{EngineId, SessionParameters, Value};
use crate::{EngineError, Result};

const PROGRESS_SETUP: u32 = 200;
const PROGRESS_SETUP_INFERIOR: u32 = 250;
const PROGRESS_RUN: u32 = 300;
const PROGRESS_PING_LIMIT: u32 = 800;
const PROGRESS_CANCELED: u32 = 900;
const PROGRESS_DONE: u32 = 1000;

/// Backend-facing work scheduled for the next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredStep {
    SetupEngine,
    SetupInferior,
    RunEngine,
    /// Second half of `RunEngine`, once the initial breakpoint batch is
    /// acknowledged.
    ContinueRunEngine,
    Interrupt,
    Execute(ExecCommand),
    ShutdownInferior,
    ShutdownEngine,
    FinishDebugger,
    SynchronizeBreakpoints,
    UpdateAll,
    UpdateLocals,
    ReloadRegisters,
}

impl DeferredStep {
    pub fn name(&self) -> &'static str {
        match self {
            DeferredStep::SetupEngine => "SETUP ENGINE",
            DeferredStep::SetupInferior => "SETUP INFERIOR",
            DeferredStep::RunEngine => "RUN ENGINE",
            DeferredStep::ContinueRunEngine => "RUN ENGINE (CONTINUED)",
            DeferredStep::Interrupt => "INTERRUPT INFERIOR",
            DeferredStep::Execute(_) => "EXECUTE",
            DeferredStep::ShutdownInferior => "SHUTDOWN INFERIOR",
            DeferredStep::ShutdownEngine => "SHUTDOWN ENGINE",
            DeferredStep::FinishDebugger => "FINISH DEBUGGER",
            DeferredStep::SynchronizeBreakpoints => "SYNCHRONIZE BREAKPOINTS",
            DeferredStep::UpdateAll => "UPDATE ALL",
            DeferredStep::UpdateLocals => "UPDATE LOCALS",
            DeferredStep::ReloadRegisters => "RELOAD REGISTERS",
        }
    }

    /// Steps that are pointless to queue twice.
    fn coalesces(&self) -> bool {
        matches!(
            self,
            DeferredStep::SynchronizeBreakpoints
                | DeferredStep::UpdateAll
                | DeferredStep::UpdateLocals
                | DeferredStep::ReloadRegisters
        )
    }
}

pub struct DebuggerEngine {
    id: EngineId,
    backend: Box<dyn Backend>,
    link: Correlator,
    config: SessionConfig,
    params: SessionParameters,

    state: SessionState,
    last_good_state: SessionState,
    target_state: SessionState,
    deferred: VecDeque<DeferredStep>,

    breakpoints: SharedBreakHandler,
    sinks: DataSinks,
    events: EventSink,

    reported_failures: HashSet<FailureKind>,
    progress: u32,
    inferior_pid: i64,
    continue_at_next_spontaneous_stop: bool,
    slave: bool,
    unexpected_transitions: usize,

    last_cookie: u64,
    disassembler_cookies: HashSet<u64>,
    memory_cookies: HashSet<u64>,
    location: Option<Location>,
}

impl DebuggerEngine {
    pub fn new(
        id: EngineId,
        backend: Box<dyn Backend>,
        outbound: mpsc::UnboundedSender<String>,
        config: SessionConfig,
        breakpoints: SharedBreakHandler,
    ) -> Self {
        let link = Correlator::new(outbound, &config.block_terminator);
        Self {
            id,
            backend,
            link,
            config,
            params: SessionParameters::default(),
            state: SessionState::NotReady,
            last_good_state: SessionState::NotReady,
            target_state: SessionState::NotReady,
            deferred: VecDeque::new(),
            breakpoints,
            sinks: DataSinks::default(),
            events: EventSink::new(),
            reported_failures: HashSet::new(),
            progress: 0,
            inferior_pid: 0,
            continue_at_next_spontaneous_stop: false,
            slave: false,
            unexpected_transitions: 0,
            last_cookie: 0,
            disassembler_cookies: HashSet::new(),
            memory_cookies: HashSet::new(),
            location: None,
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_good_state(&self) -> SessionState {
        self.last_good_state
    }

    pub fn target_state(&self) -> SessionState {
        self.target_state
    }

    pub fn params(&self) -> &SessionParameters {
        &self.params
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sinks(&self) -> &DataSinks {
        &self.sinks
    }

    pub fn breakpoints(&self) -> SharedBreakHandler {
        self.breakpoints.clone()
    }

    pub fn progress(&self) -> u32 {
        self.progress
    }

    pub fn inferior_pid(&self) -> i64 {
        self.inferior_pid
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn link(&self) -> &Correlator {
        &self.link
    }

    /// Transitions outside the legal table seen so far.
    pub fn unexpected_transitions(&self) -> usize {
        self.unexpected_transitions
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities(&self.params)
    }

    pub fn has_capability(&self, capability: Capabilities) -> bool {
        self.capabilities().contains(capability)
    }

    pub fn debugger_actions_enabled(&self) -> bool {
        self.state.debugger_actions_enabled()
    }

    /// Whether the session is being torn down.
    pub fn is_dying(&self) -> bool {
        self.target_state == SessionState::Finished
    }

    pub fn is_slave_engine(&self) -> bool {
        self.slave
    }

    /// Slave engines leave view updates to their master.
    pub fn set_slave_engine(&mut self, slave: bool) {
        self.slave = slave;
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn events_mut(&mut self) -> &mut EventSink {
        &mut self.events
    }

    /// Give a finished engine a new backend connection before a restart.
    pub fn reconnect(&mut self, outbound: mpsc::UnboundedSender<String>) {
        self.link.reconnect(outbound);
    }

    // ------------------------------------------------------------------
    // Deferred steps
    // ------------------------------------------------------------------

    pub fn has_deferred_work(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn pending_steps(&self) -> impl Iterator<Item = &DeferredStep> {
        self.deferred.iter()
    }

    fn push_step(&mut self, step: DeferredStep) {
        if step.coalesces() && self.deferred.contains(&step) {
            return;
        }
        log::debug!("QUEUE: {}", step.name());
        self.deferred.push_back(step);
    }

    /// Run the steps queued before this call. Steps they queue wait for
    /// the next tick. Returns the number of steps run.
    pub fn run_deferred(&mut self) -> usize {
        let count = self.deferred.len();
        for _ in 0..count {
            let Some(step) = self.deferred.pop_front() else {
                break;
            };
            self.run_step(step);
        }
        count
    }

    fn expect_state(&self, step: &DeferredStep, expected: &[SessionState]) -> bool {
        if expected.contains(&self.state) {
            return true;
        }
        log::warn!("CALL: {} skipped in state {}", step.name(), self.state);
        false
    }

    fn run_step(&mut self, step: DeferredStep) {
        log::debug!("CALL: {}", step.name());
        match &step {
            DeferredStep::SetupEngine => {
                if self.expect_state(&step, &[SessionState::EngineSetupRequested]) {
                    if let Err(e) = self.backend.setup_engine(&mut self.link, &self.params) {
                        log::error!("Engine setup failed: {}", e);
                        self.notify_engine_setup_failed();
                    }
                }
            }
            DeferredStep::SetupInferior => {
                if self.expect_state(&step, &[SessionState::EngineSetupOk]) {
                    self.set_progress(PROGRESS_SETUP_INFERIOR);
                    self.set_state(SessionState::InferiorSetupRequested);
                    if let Err(e) = self.backend.setup_inferior(&mut self.link, &self.params) {
                        log::error!("Inferior setup failed: {}", e);
                        self.notify_inferior_setup_failed();
                    }
                }
            }
            DeferredStep::RunEngine => {
                if self.expect_state(&step, &[SessionState::EngineRunRequested]) {
                    self.set_progress(PROGRESS_RUN);
                    let operations = self.breakpoint_pass();
                    if operations.is_empty() {
                        self.run_engine_now();
                    } else {
                        let command = batch_command(&operations).with_continuation(Continuation::RunEngine);
                        if let Err(e) = self.link.send(command) {
                            log::error!("Could not send initial breakpoints: {}", e);
                            self.notify_engine_run_failed();
                        }
                    }
                }
            }
            DeferredStep::ContinueRunEngine => {
                if self.expect_state(&step, &[SessionState::EngineRunRequested]) {
                    self.run_engine_now();
                }
            }
            DeferredStep::Interrupt => {
                if self.expect_state(&step, &[SessionState::InferiorStopRequested]) {
                    self.show_status_message("Interrupt requested...");
                    if let Err(e) = self.backend.interrupt_inferior(&mut self.link) {
                        log::error!("Interrupt failed: {}", e);
                        self.notify_inferior_stop_failed();
                    }
                }
            }
            DeferredStep::Execute(command) => {
                if self.expect_state(&step, &[SessionState::InferiorRunRequested]) {
                    if let Err(e) = self.backend.execute(&mut self.link, command) {
                        log::error!("{} failed: {}", command, e);
                        self.notify_inferior_run_failed();
                    }
                }
            }
            DeferredStep::ShutdownInferior => {
                if self.expect_state(&step, &[SessionState::InferiorShutdownRequested]) {
                    self.reset_location();
                    self.target_state = SessionState::Finished;
                    if let Err(e) = self.backend.shutdown_inferior(&mut self.link) {
                        log::error!("Inferior shutdown failed: {}", e);
                        self.notify_inferior_shutdown_failed();
                    }
                }
            }
            DeferredStep::ShutdownEngine => {
                if self.expect_state(&step, &[SessionState::EngineShutdownRequested]) {
                    self.target_state = SessionState::Finished;
                    let result = self.backend.shutdown_engine(&mut self.link);
                    self.link.close();
                    match result {
                        Ok(()) => self.notify_engine_shutdown_ok(),
                        Err(e) => {
                            log::error!("Engine shutdown failed: {}", e);
                            self.notify_engine_shutdown_failed();
                        }
                    }
                }
            }
            DeferredStep::FinishDebugger => {
                log::info!("NOTE: FINISH DEBUGGER");
                if self.expect_state(&step, &[SessionState::Finished]) {
                    self.reset_location();
                    self.link.close();
                    let progress = if self.reported_failures.is_empty() {
                        PROGRESS_DONE
                    } else {
                        PROGRESS_CANCELED
                    };
                    self.set_progress(progress);
                    self.events.emit(SessionEvent::Finished);
                }
            }
            DeferredStep::SynchronizeBreakpoints => {
                if self.deferred.contains(&DeferredStep::RunEngine) {
                    // The run step sends the initial batch itself.
                    log::debug!("CALL: {} left to RUN ENGINE", step.name());
                } else {
                    self.attempt_breakpoint_synchronization();
                }
            }
            DeferredStep::UpdateAll => {
                if let Err(e) = self.update_all() {
                    log::debug!("Skipping view update: {}", e);
                }
            }
            DeferredStep::UpdateLocals => {
                if let Err(e) = self.update_locals() {
                    log::debug!("Skipping locals update: {}", e);
                }
            }
            DeferredStep::ReloadRegisters => {
                if let Err(e) = self.reload_registers() {
                    log::debug!("Skipping register reload: {}", e);
                }
            }
        }
    }

    fn run_engine_now(&mut self) {
        self.show_status_message("Running requested...");
        if let Err(e) = self.backend.run_engine(&mut self.link) {
            log::error!("Run failed: {}", e);
            self.notify_engine_run_failed();
        }
    }

    fn queue_run_engine(&mut self) {
        self.set_state(SessionState::EngineRunRequested);
        self.push_step(DeferredStep::RunEngine);
    }

    fn queue_shutdown_engine(&mut self) {
        self.set_state(SessionState::EngineShutdownRequested);
        self.push_step(DeferredStep::ShutdownEngine);
    }

    fn queue_shutdown_inferior(&mut self) {
        self.set_state(SessionState::InferiorShutdownRequested);
        self.push_step(DeferredStep::ShutdownInferior);
    }

    fn queue_finish_debugger(&mut self) {
        if !matches!(
            self.state,
            SessionState::EngineShutdownOk | SessionState::EngineShutdownFailed
        ) {
            log::warn!("Finishing from unexpected state {}", self.state);
        }
        self.set_state(SessionState::Finished);
        self.push_step(DeferredStep::FinishDebugger);
    }

    // ------------------------------------------------------------------
    // State bookkeeping
    // ------------------------------------------------------------------

    fn set_state(&mut self, state: SessionState) {
        self.set_state_forced(state, false);
    }

    fn set_state_forced(&mut self, state: SessionState, forced: bool) {
        let old = self.state;
        self.state = state;

        let msg = format!(
            "State changed{} from {}({}) to {}({})",
            if forced { " BY FORCE" } else { "" },
            old,
            old.index(),
            state,
            state.index()
        );
        if !forced && !is_allowed_transition(old, state) {
            self.unexpected_transitions += 1;
            log::warn!("UNEXPECTED STATE TRANSITION: {}", msg);
        } else {
            log::debug!("{}", msg);
        }

        if state == SessionState::Finished {
            let released = self.breakpoints.lock().release_all(self.id);
            for id in released {
                self.events.emit(SessionEvent::BreakpointReleased(id));
            }
            self.sinks.clear_all();
            for command in self.link.retire_all() {
                log::debug!("Dropping unanswered command {} [{}]", command.name, command.token);
            }
        }

        if state == SessionState::InferiorRunOk {
            self.sinks.threads.notify_running();
        }

        self.events.emit(SessionEvent::StateChanged {
            from: old,
            to: state,
            forced,
        });
        self.update_views();

        // The run step synchronizes on its own before starting the inferior.
        if state.accepts_breakpoint_changes() && state != SessionState::EngineRunRequested {
            self.push_step(DeferredStep::SynchronizeBreakpoints);
        }
    }

    fn update_views(&mut self) {
        if self.slave {
            return;
        }
        self.events.emit(SessionEvent::ViewsUpdateRequested(self.state));
    }

    fn set_progress(&mut self, progress: u32) {
        if self.progress != progress {
            self.progress = progress;
            self.events.emit(SessionEvent::Progress(progress));
        }
    }

    /// Keep-alive bookkeeping while waiting on the backend.
    pub fn progress_ping(&mut self) {
        if self.progress < PROGRESS_PING_LIMIT {
            self.set_progress((self.progress + 2).min(PROGRESS_PING_LIMIT));
        }
    }

    fn report_failure(&mut self, kind: FailureKind) {
        if self.reported_failures.insert(kind) {
            log::error!("{}", kind);
            self.events.emit(SessionEvent::Failure(kind));
        }
    }

    fn show_status_message(&mut self, message: &str) {
        log::info!("{}", message);
        self.events.emit(SessionEvent::StatusMessage(message.to_string()));
    }

    fn reset_location(&mut self) {
        self.location = None;
    }

    fn goto_location(&mut self, location: Location) {
        self.location = Some(location.clone());
        self.events.emit(SessionEvent::Location(location));
    }

    fn goto_frame(&mut self, frame: &StackFrame) {
        let use_assembler = self.config.operate_by_instruction || !frame.usable;
        self.goto_location(Location {
            address: frame.address,
            file: frame.file.clone(),
            line: frame.line,
            use_assembler,
        });
    }

    fn invalid_state(&self, operation: &'static str) -> EngineError {
        log::warn!("{} not possible in state {}", operation, self.state);
        EngineError::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// Send a data command. A failed write means the backend is gone.
    fn send(&mut self, command: Command) -> Result<u64> {
        match self.link.send(command) {
            Ok(token) => Ok(token),
            Err(e) => {
                if !self.is_dying() {
                    self.notify_engine_ill();
                }
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Client requests
    // ------------------------------------------------------------------

    /// Begin a session. Allowed before the first session and after the
    /// previous one finished.
    pub fn start_setup(&mut self, params: SessionParameters) -> Result<()> {
        if !matches!(self.state, SessionState::NotReady | SessionState::Finished) {
            return Err(self.invalid_state("start_setup"));
        }
        log::info!("{} starting session for {}", self.id, params.executable.display());

        self.params = params;
        self.target_state = SessionState::NotReady;
        self.last_good_state = SessionState::NotReady;
        self.reported_failures.clear();
        self.continue_at_next_spontaneous_stop = false;
        self.disassembler_cookies.clear();
        self.memory_cookies.clear();
        self.inferior_pid = self.params.attach_pid.map(i64::from).unwrap_or(0);

        if self.params.break_at_main {
            self.breakpoints.lock().break_by_function("main");
        }

        self.set_state(SessionState::EngineSetupRequested);
        self.set_progress(PROGRESS_SETUP);
        self.push_step(DeferredStep::SetupEngine);
        Ok(())
    }

    /// Start the inferior after a setup that did not run it automatically,
    /// or continue a stopped one.
    pub fn request_run(&mut self) -> Result<()> {
        match self.state {
            SessionState::InferiorSetupOk => {
                self.queue_run_engine();
                Ok(())
            }
            SessionState::InferiorStopOk => self.request_exec(ExecCommand::Continue),
            _ => Err(self.invalid_state("request_run")),
        }
    }

    /// Resume a stopped inferior with `command`.
    pub fn request_exec(&mut self, command: ExecCommand) -> Result<()> {
        if self.state != SessionState::InferiorStopOk {
            return Err(self.invalid_state(command.name()));
        }
        let required = command.required_capability();
        if !self.has_capability(required) {
            return Err(EngineError::Unsupported(required));
        }
        self.reset_location();
        self.notify_inferior_run_requested();
        self.push_step(DeferredStep::Execute(command));
        Ok(())
    }

    pub fn request_step(&mut self) -> Result<()> {
        self.request_exec(ExecCommand::Step)
    }

    pub fn request_step_instruction(&mut self) -> Result<()> {
        self.request_exec(ExecCommand::StepI)
    }

    pub fn request_next(&mut self) -> Result<()> {
        self.request_exec(ExecCommand::Next)
    }

    pub fn request_next_instruction(&mut self) -> Result<()> {
        self.request_exec(ExecCommand::NextI)
    }

    pub fn request_step_out(&mut self) -> Result<()> {
        self.request_exec(ExecCommand::StepOut)
    }

    pub fn request_continue(&mut self) -> Result<()> {
        self.request_exec(ExecCommand::Continue)
    }

    pub fn request_run_to_line(&mut self, file: &str, line: u32, address: u64) -> Result<()> {
        self.request_exec(ExecCommand::RunToLine {
            file: file.to_string(),
            line,
            address,
        })
    }

    pub fn request_run_to_function(&mut self, function: &str) -> Result<()> {
        self.request_exec(ExecCommand::RunToFunction(function.to_string()))
    }

    pub fn request_jump_to_line(&mut self, file: &str, line: u32, address: u64) -> Result<()> {
        self.request_exec(ExecCommand::JumpToLine {
            file: file.to_string(),
            line,
            address,
        })
    }

    pub fn request_interrupt(&mut self) -> Result<()> {
        if self.state != SessionState::InferiorRunOk {
            return Err(self.invalid_state("request_interrupt"));
        }
        self.set_state(SessionState::InferiorStopRequested);
        self.push_step(DeferredStep::Interrupt);
        Ok(())
    }

    /// Steer the session to `Finished` along the regular shutdown path.
    pub fn request_shutdown(&mut self) {
        log::info!("QUIT DEBUGGER REQUESTED in state {}", self.state);
        match self.state {
            SessionState::NotReady | SessionState::Finished => {
                log::debug!("Nothing to shut down");
            }
            SessionState::InferiorStopOk | SessionState::InferiorStopFailed => {
                self.target_state = SessionState::Finished;
                self.queue_shutdown_inferior();
            }
            SessionState::InferiorRunOk => {
                self.target_state = SessionState::Finished;
                self.set_state(SessionState::InferiorStopRequested);
                self.push_step(DeferredStep::Interrupt);
            }
            _ => {
                self.target_state = SessionState::Finished;
                self.notify_inferior_ill();
            }
        }
    }

    /// First call shuts down politely, a second call drops the backend.
    pub fn abort(&mut self) {
        if self.state == SessionState::Finished {
            return;
        }
        if self.is_dying() {
            log::warn!("ABORTING DEBUGGER. SECOND TIME.");
            self.link.close();
            self.notify_engine_spontaneous_shutdown();
        } else {
            log::warn!("ABORTING DEBUGGER. FIRST TIME.");
            self.request_shutdown();
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub fn notify_engine_setup_ok(&mut self) {
        log::info!("NOTE: ENGINE SETUP OK");
        self.set_state(SessionState::EngineSetupOk);
        self.push_step(DeferredStep::SetupInferior);
    }

    pub fn notify_engine_setup_failed(&mut self) {
        log::info!("NOTE: ENGINE SETUP FAILED");
        self.set_state(SessionState::EngineSetupFailed);
        self.report_failure(FailureKind::EngineSetup);
        self.set_progress(PROGRESS_CANCELED);
        self.set_state(SessionState::Finished);
        self.push_step(DeferredStep::FinishDebugger);
    }

    pub fn notify_inferior_setup_ok(&mut self) {
        log::info!("NOTE: INFERIOR SETUP OK");
        self.set_state(SessionState::InferiorSetupOk);
        if self.config.run_after_setup {
            self.queue_run_engine();
        }
    }

    pub fn notify_inferior_setup_failed(&mut self) {
        log::info!("NOTE: INFERIOR SETUP FAILED");
        self.set_state(SessionState::InferiorSetupFailed);
        self.report_failure(FailureKind::InferiorSetup);
        self.queue_shutdown_engine();
    }

    pub fn notify_inferior_unrunnable(&mut self) {
        log::info!("NOTE: INFERIOR UNRUNNABLE");
        self.set_progress(PROGRESS_DONE);
        self.set_state(SessionState::InferiorUnrunnable);
    }

    pub fn notify_engine_run_failed(&mut self) {
        log::info!("NOTE: ENGINE RUN FAILED");
        self.set_progress(PROGRESS_CANCELED);
        self.set_state(SessionState::EngineRunFailed);
        self.report_failure(FailureKind::EngineRun);
        self.queue_shutdown_inferior();
    }

    pub fn notify_engine_run_and_inferior_run_ok(&mut self) {
        log::info!("NOTE: ENGINE RUN AND INFERIOR RUN OK");
        self.set_progress(PROGRESS_DONE);
        self.set_state(SessionState::InferiorRunRequested);
        self.notify_inferior_run_ok();
    }

    pub fn notify_engine_run_and_inferior_stop_ok(&mut self) {
        log::info!("NOTE: ENGINE RUN AND INFERIOR STOP OK");
        self.set_progress(PROGRESS_DONE);
        self.set_state(SessionState::InferiorStopRequested);
        self.notify_inferior_stop_ok();
    }

    pub fn notify_inferior_run_requested(&mut self) {
        log::info!("NOTE: INFERIOR RUN REQUESTED");
        self.set_state(SessionState::InferiorRunRequested);
    }

    pub fn notify_inferior_run_ok(&mut self) {
        if self.state == SessionState::InferiorRunOk {
            log::debug!("NOTE: INFERIOR RUN OK - REPEATED");
            return;
        }
        log::info!("NOTE: INFERIOR RUN OK");
        self.set_state(SessionState::InferiorRunOk);
    }

    pub fn notify_inferior_run_failed(&mut self) {
        log::info!("NOTE: INFERIOR RUN FAILED");
        self.set_state(SessionState::InferiorRunFailed);
        self.set_state(SessionState::InferiorStopOk);
        self.report_failure(FailureKind::InferiorRun);
        if self.is_dying() {
            self.queue_shutdown_inferior();
        }
    }

    pub fn notify_inferior_stop_ok(&mut self) {
        log::info!("NOTE: INFERIOR STOP OK");
        if self.is_dying() {
            log::info!("NOTE: ... WHILE DYING");
            if matches!(
                self.state,
                SessionState::InferiorStopRequested | SessionState::InferiorRunRequested | SessionState::InferiorRunOk
            ) {
                log::info!("NOTE: ... FORWARDING TO 'STOP OK'");
                self.set_state(SessionState::InferiorStopOk);
            }
            if matches!(self.state, SessionState::InferiorStopOk | SessionState::InferiorStopFailed) {
                self.queue_shutdown_inferior();
            }
            return;
        }
        self.set_state(SessionState::InferiorStopOk);
    }

    pub fn notify_inferior_spontaneous_stop(&mut self) {
        log::info!("NOTE: INFERIOR SPONTANEOUS STOP");
        if self.is_dying() {
            self.notify_inferior_stop_ok();
            return;
        }
        self.set_state(SessionState::InferiorStopOk);
    }

    pub fn notify_inferior_stop_failed(&mut self) {
        log::info!("NOTE: INFERIOR STOP FAILED");
        self.set_state(SessionState::InferiorStopFailed);
        self.report_failure(FailureKind::InferiorStop);
        self.queue_shutdown_engine();
    }

    pub fn notify_inferior_shutdown_ok(&mut self) {
        log::info!("NOTE: INFERIOR SUCCESSFULLY SHUT DOWN");
        self.last_good_state = SessionState::NotReady;
        self.set_state(SessionState::InferiorShutdownOk);
        self.queue_shutdown_engine();
    }

    pub fn notify_inferior_shutdown_failed(&mut self) {
        log::info!("NOTE: INFERIOR SHUTDOWN FAILED");
        self.set_state(SessionState::InferiorShutdownFailed);
        self.report_failure(FailureKind::InferiorShutdown);
        self.queue_shutdown_engine();
    }

    /// Escape hatch: the inferior misbehaves. Legal in any state but
    /// `Finished`.
    pub fn notify_inferior_ill(&mut self) {
        log::info!("NOTE: INFERIOR ILL");
        if self.state == SessionState::Finished {
            log::info!("NOTE: ... IGNORED, SESSION FINISHED");
            return;
        }
        self.target_state = SessionState::Finished;
        self.last_good_state = self.state;
        if self.state == SessionState::InferiorRunRequested {
            // No answer to the run request; assume the inferior is dead.
            self.set_state(SessionState::InferiorRunFailed);
            self.set_state(SessionState::InferiorStopOk);
        }
        self.queue_shutdown_inferior();
    }

    /// Escape hatch: the backend misbehaves. Legal in any state but
    /// `Finished`.
    pub fn notify_engine_ill(&mut self) {
        log::info!("NOTE: ENGINE ILL ******");
        if self.state == SessionState::Finished {
            log::info!("NOTE: ... IGNORED, SESSION FINISHED");
            return;
        }
        self.target_state = SessionState::Finished;
        self.last_good_state = self.state;
        match self.state {
            SessionState::InferiorRunRequested | SessionState::InferiorRunOk => {
                log::info!("ATTEMPT TO INTERRUPT INFERIOR");
                self.set_state_forced(SessionState::InferiorStopRequested, true);
                self.push_step(DeferredStep::Interrupt);
            }
            SessionState::InferiorStopRequested | SessionState::InferiorStopOk => {
                log::info!("FORWARDING STATE TO InferiorShutdownFailed");
                self.set_state_forced(SessionState::InferiorShutdownFailed, true);
                self.queue_shutdown_engine();
            }
            _ => self.queue_shutdown_engine(),
        }
    }

    pub fn notify_engine_shutdown_ok(&mut self) {
        if self.state == SessionState::Finished {
            log::debug!("NOTE: ENGINE SHUTDOWN OK - ALREADY FINISHED");
            return;
        }
        log::info!("NOTE: ENGINE SHUTDOWN OK");
        self.set_state(SessionState::EngineShutdownOk);
        self.queue_finish_debugger();
    }

    pub fn notify_engine_shutdown_failed(&mut self) {
        if self.state == SessionState::Finished {
            log::debug!("NOTE: ENGINE SHUTDOWN FAILED - ALREADY FINISHED");
            return;
        }
        log::info!("NOTE: ENGINE SHUTDOWN FAILED");
        self.set_state(SessionState::EngineShutdownFailed);
        self.report_failure(FailureKind::EngineShutdown);
        self.queue_finish_debugger();
    }

    /// The backend went away on its own.
    pub fn notify_engine_spontaneous_shutdown(&mut self) {
        log::info!("NOTE: ENGINE SPONTANEOUS SHUTDOWN");
        if self.state == SessionState::Finished {
            return;
        }
        if !self.is_dying() {
            self.report_failure(FailureKind::EngineCrashed);
        }
        self.target_state = SessionState::Finished;
        self.link.close();
        self.set_state_forced(SessionState::EngineShutdownOk, true);
        self.queue_finish_debugger();
    }

    pub fn notify_inferior_exited(&mut self) {
        log::info!("NOTE: INFERIOR EXITED");
        self.reset_location();
        if self.state.is_shutting_down() {
            log::debug!("NOTE: ... ALREADY SHUTTING DOWN");
            return;
        }
        self.target_state = SessionState::Finished;
        // The inferior is gone even if the stop notification got lost.
        if self.state == SessionState::InferiorRunOk {
            self.set_state(SessionState::InferiorStopRequested);
            self.set_state(SessionState::InferiorStopOk);
        }
        self.set_state(SessionState::InferiorShutdownRequested);
        self.set_state(SessionState::InferiorShutdownOk);
        self.queue_shutdown_engine();
    }

    pub fn notify_inferior_pid(&mut self, pid: i64) {
        log::info!("Taking notice of pid {}", pid);
        if self.inferior_pid == pid {
            return;
        }
        self.inferior_pid = pid;
        self.events.emit(SessionEvent::InferiorPid(pid));
    }

    // ------------------------------------------------------------------
    // Breakpoints
    // ------------------------------------------------------------------

    fn breakpoint_pass(&mut self) -> Vec<BreakpointOperation> {
        let handler = self.breakpoints.clone();
        let backend = &self.backend;
        let params = &self.params;
        let operations = handler
            .lock()
            .synchronize(self.id, |bp| backend.accepts_breakpoint(bp, params));
        operations
    }

    /// Send every pending breakpoint edit as one batch. Returns `true`
    /// when there was nothing to send.
    pub fn attempt_breakpoint_synchronization(&mut self) -> bool {
        if !self.state.accepts_breakpoint_changes() {
            log::debug!("BREAKPOINT SYNCHRONIZATION NOT POSSIBLE IN STATE {}", self.state);
            return true;
        }
        let operations = self.breakpoint_pass();
        if operations.is_empty() {
            return true;
        }
        log::debug!("Synchronizing {} breakpoint operation(s)", operations.len());
        if let Err(e) = self.send(batch_command(&operations)) {
            log::warn!("Breakpoint batch not delivered: {}", e);
        }
        false
    }

    /// Queue a synchronization pass, e.g. after a client edit.
    pub fn request_breakpoint_synchronization(&mut self) {
        self.push_step(DeferredStep::SynchronizeBreakpoints);
    }

    // ------------------------------------------------------------------
    // Data requests
    // ------------------------------------------------------------------

    fn require_stopped(&self, operation: &'static str) -> Result<()> {
        match self.state {
            SessionState::InferiorStopOk | SessionState::InferiorUnrunnable => Ok(()),
            _ => Err(self.invalid_state(operation)),
        }
    }

    fn require_capability(&self, capability: Capabilities) -> Result<()> {
        if self.has_capability(capability) {
            Ok(())
        } else {
            Err(EngineError::Unsupported(capability))
        }
    }

    fn next_cookie(&mut self) -> u64 {
        self.last_cookie += 1;
        self.last_cookie
    }

    pub fn reload_registers(&mut self) -> Result<()> {
        self.require_stopped("reload_registers")?;
        self.require_capability(Capabilities::REGISTER)?;
        self.send(Command::new("reportRegisters"))?;
        Ok(())
    }

    pub fn reload_modules(&mut self) -> Result<()> {
        self.require_stopped("reload_modules")?;
        self.require_capability(Capabilities::RELOAD_MODULE)?;
        self.send(Command::new("listModules"))?;
        Ok(())
    }

    pub fn request_module_symbols(&mut self, module: &str) -> Result<()> {
        self.require_stopped("request_module_symbols")?;
        self.require_capability(Capabilities::SHOW_MODULE_SYMBOLS)?;
        self.send(Command::new("listSymbols").arg("module", module))?;
        Ok(())
    }

    pub fn reload_full_stack(&mut self) -> Result<()> {
        self.require_stopped("reload_full_stack")?;
        self.send(Command::new("reportStack").arg("stacklimit", -1))?;
        Ok(())
    }

    pub fn update_stack(&mut self) -> Result<()> {
        self.require_stopped("update_stack")?;
        let limit = self.config.max_stack_depth;
        self.send(Command::new("reportStack").arg("stacklimit", limit))?;
        Ok(())
    }

    pub fn update_locals(&mut self) -> Result<()> {
        self.require_stopped("update_locals")?;
        let watchers: Vec<_> = self
            .sinks
            .watches
            .watchers()
            .iter()
            .map(|(iname, expression)| {
                group([
                    ("iname", iname.as_str().into()),
                    ("exp", to_hex(expression).into()),
                ])
            })
            .collect();

        let command = Command::new("updateData")
            .list("expanded", Vec::<String>::new())
            .list("typeformats", Vec::<String>::new())
            .list("formats", Vec::<String>::new())
            .arg("passexceptions", false)
            .arg("fancy", self.config.use_debugging_helpers)
            .arg("autoderef", self.config.auto_deref_pointers)
            .arg("dyntype", self.config.use_dynamic_type)
            .arg("partial", false)
            .arg("tooltiponly", false)
            .list("watchers", watchers);
        self.send(command)?;

        if self.has_capability(Capabilities::REGISTER) {
            self.reload_registers()?;
        }
        Ok(())
    }

    pub fn update_all(&mut self) -> Result<()> {
        self.update_stack()?;
        self.update_locals()
    }

    /// Select frame `index`. Asking for the frame one past the end loads a
    /// deeper stack instead.
    pub fn activate_frame(&mut self, index: usize) -> Result<()> {
        self.reset_location();
        self.require_stopped("activate_frame")?;

        let size = self.sinks.stack.stack_size();
        if index == size {
            self.send(Command::new("reportStack").arg("stacklimit", size * 10 + 3))?;
            return Ok(());
        }

        let thread = self.sinks.threads.current_id().unwrap_or("").to_string();
        self.send(Command::new("activateFrame").arg("index", index).arg("thread", thread))?;
        self.update_locals()
    }

    pub fn select_thread(&mut self, id: &str) -> Result<()> {
        self.require_stopped("select_thread")?;
        self.sinks.threads.set_current(id);
        self.send(Command::new("selectThread").arg("id", id))?;
        Ok(())
    }

    pub fn assign_value(&mut self, expression: &str, value: &str) -> Result<()> {
        self.require_stopped("assign_value")?;
        self.send(
            Command::new("assignValue")
                .arg("exp", to_hex(expression))
                .arg("value", to_hex(value)),
        )?;
        Ok(())
    }

    pub fn set_register_value(&mut self, name: &str, value: &str) -> Result<()> {
        self.require_stopped("set_register_value")?;
        self.require_capability(Capabilities::REGISTER)?;
        self.send(Command::new("setRegister").arg("name", name).arg("value", value))?;
        Ok(())
    }

    /// Request disassembly around `address`; the reply carries the
    /// returned cookie.
    pub fn fetch_disassembler(&mut self, address: u64, function: &str) -> Result<u64> {
        self.require_stopped("fetch_disassembler")?;
        self.require_capability(Capabilities::DISASSEMBLER)?;
        let cookie = self.next_cookie();
        self.send(
            Command::new("disassemble")
                .arg("cookie", cookie)
                .arg("address", address)
                .arg("function", function)
                .arg("flavor", self.config.disassembly_flavor()),
        )?;
        self.disassembler_cookies.insert(cookie);
        Ok(cookie)
    }

    pub fn fetch_memory(&mut self, address: u64, length: u64) -> Result<u64> {
        self.require_stopped("fetch_memory")?;
        self.require_capability(Capabilities::SHOW_MEMORY)?;
        let cookie = self.next_cookie();
        self.send(
            Command::new("fetchMemory")
                .arg("address", address)
                .arg("length", length)
                .arg("cookie", cookie),
        )?;
        self.memory_cookies.insert(cookie);
        Ok(cookie)
    }

    pub fn change_memory(&mut self, address: u64, data: &[u8]) -> Result<u64> {
        self.require_stopped("change_memory")?;
        self.require_capability(Capabilities::SHOW_MEMORY)?;
        let cookie = self.next_cookie();
        self.send(
            Command::new("writeMemory")
                .arg("address", address)
                .arg("data", hex::encode(data))
                .arg("cookie", cookie),
        )?;
        self.memory_cookies.insert(cookie);
        Ok(cookie)
    }

    pub fn create_full_backtrace(&mut self) -> Result<()> {
        self.require_stopped("create_full_backtrace")?;
        self.require_capability(Capabilities::CREATE_FULL_BACKTRACE)?;
        self.send(Command::new("createFullBacktrace"))?;
        Ok(())
    }

    pub fn execute_debugger_command(&mut self, command: &str) -> Result<()> {
        if !self.debugger_actions_enabled() {
            return Err(self.invalid_state("execute_debugger_command"));
        }
        self.send(Command::new("executeDebuggerCommand").arg("command", command))?;
        Ok(())
    }

    /// Watch `expression`; returns its iname.
    pub fn add_watcher(&mut self, expression: &str) -> Result<String> {
        self.require_capability(Capabilities::ADD_WATCHER)?;
        let iname = self.sinks.watches.add_watcher(expression);
        if self.require_stopped("add_watcher").is_ok() {
            self.push_step(DeferredStep::UpdateLocals);
        }
        Ok(iname)
    }

    pub fn remove_watcher(&mut self, iname: &str) {
        self.sinks.watches.remove_watcher(iname);
        self.events.emit(SessionEvent::DataUpdated(SinkKind::Watches));
    }

    // ------------------------------------------------------------------
    // Backend input
    // ------------------------------------------------------------------

    /// Feed raw stdout bytes of the backend.
    pub fn handle_backend_output(&mut self, bytes: &[u8]) {
        if self.state == SessionState::Finished {
            log::debug!("Dropping {} byte(s) of backend output after finish", bytes.len());
            return;
        }
        for response in self.link.feed(bytes) {
            self.handle_response(response);
        }
    }

    pub fn handle_backend_stderr(&mut self, text: &str) {
        log::warn!("Backend stderr: {}", text);
        self.events.emit(SessionEvent::Output {
            channel: OutputChannel::DebuggerStderr,
            text: text.to_string(),
        });
    }

    pub fn handle_backend_exited(&mut self, code: Option<i32>) {
        log::info!("Backend process finished, code {:?}", code);
        if self.state >= SessionState::EngineShutdownRequested {
            return;
        }
        self.notify_engine_spontaneous_shutdown();
    }

    pub fn handle_backend_error(&mut self, message: &str) {
        log::error!("Backend I/O error: {}", message);
        if self.state == SessionState::Finished || self.is_dying() {
            return;
        }
        self.notify_engine_ill();
    }

    pub fn handle_response(&mut self, response: Response) {
        match response {
            Response::State(state) => self.handle_state(&state),
            Response::Data(value) => {
                self.sinks.watches.refresh_locals(&value, false);
                self.events.emit(SessionEvent::DataUpdated(SinkKind::Watches));
            }
            Response::Stack(value) => {
                let frames = value
                    .get("frames")
                    .map(Value::children)
                    .unwrap_or_default()
                    .into_iter()
                    .map(StackFrame::from_value)
                    .collect();
                let can_expand = value.get("hasmore").map(Value::to_int).unwrap_or(0) != 0;
                self.sinks.stack.set_frames(frames, can_expand);
                self.events.emit(SessionEvent::DataUpdated(SinkKind::Stack));
            }
            Response::StackPosition(value) => {
                let index = value.get("id").map(Value::to_int).unwrap_or(0);
                self.set_stack_position(usize::try_from(index).unwrap_or(0));
            }
            Response::StackTop(_) => {
                let index = self.sinks.stack.first_usable_index();
                self.set_stack_position(index);
            }
            Response::Registers(value) => {
                self.sinks.registers.update(&value);
                self.events.emit(SessionEvent::DataUpdated(SinkKind::Registers));
            }
            Response::Threads(value) => {
                self.sinks.threads.update(&value);
                if self.sinks.threads.current().is_none() {
                    if let Some(first) = self.sinks.threads.thread_at(0).map(|t| t.id.clone()) {
                        if let Err(e) = self.select_thread(&first) {
                            log::debug!("Cannot select thread {}: {}", first, e);
                        }
                    }
                }
                self.events.emit(SessionEvent::DataUpdated(SinkKind::Threads));
                self.update_views();
            }
            Response::TypeInfo(_) => log::debug!("Ignoring type info"),
            Response::Location(value) => {
                let address = value.get("addr").map(Value::to_address).unwrap_or(0);
                let file = value.field("file").to_string();
                let line = value.get("line").map(Value::to_int).unwrap_or(0);
                let use_assembler = self.config.operate_by_instruction || file.is_empty() || line <= 0;
                self.goto_location(Location {
                    address,
                    file,
                    line,
                    use_assembler,
                });
            }
            Response::Modules(value) => {
                self.sinks.modules.update(&value);
                self.events.emit(SessionEvent::DataUpdated(SinkKind::Modules));
            }
            Response::Symbols(value) => {
                let symbols = value
                    .get("symbols")
                    .map(Value::children)
                    .unwrap_or_default()
                    .into_iter()
                    .map(Symbol::from_value)
                    .collect();
                self.events.emit(SessionEvent::ModuleSymbols {
                    module: value.field("module").to_string(),
                    symbols,
                });
            }
            Response::BreakpointAdded(value) | Response::BreakpointChanged(value) => {
                let result = self.breakpoints.lock().apply_update(self.id, &value);
                match result {
                    Ok(id) => {
                        self.events.emit(SessionEvent::BreakpointResponseChanged(id));
                        self.push_step(DeferredStep::SynchronizeBreakpoints);
                    }
                    Err(e) => log::warn!("Ignoring breakpoint acknowledgement: {}", e),
                }
            }
            Response::BreakpointRemoved(value) => {
                let result = self.breakpoints.lock().apply_removed(self.id, &value);
                match result {
                    Ok(id) => self.events.emit(SessionEvent::BreakpointResponseChanged(id)),
                    Err(e) => log::warn!("Ignoring breakpoint removal: {}", e),
                }
            }
            Response::Output(value) => {
                let channel = match value.field("channel") {
                    "stdout" => OutputChannel::AppOutput,
                    "stderr" => OutputChannel::AppError,
                    _ => OutputChannel::AppStuff,
                };
                let text = value.get("data").map(Value::hex_text).unwrap_or_default();
                self.events.emit(SessionEvent::Output { channel, text });
            }
            Response::Disassembly(value) => {
                let cookie = value.get("cookie").map(Value::to_int).unwrap_or(0);
                let cookie = u64::try_from(cookie).unwrap_or(0);
                if !self.disassembler_cookies.remove(&cookie) {
                    log::debug!("Dropping disassembly for unknown cookie {}", cookie);
                    return;
                }
                let lines = value
                    .get("lines")
                    .map(Value::children)
                    .unwrap_or_default()
                    .into_iter()
                    .map(DisassemblerLine::from_value)
                    .collect();
                self.events.emit(SessionEvent::Disassembly { cookie, lines });
            }
            Response::Memory(value) => {
                let cookie = value.get("cookie").map(Value::to_int).unwrap_or(0);
                let cookie = u64::try_from(cookie).unwrap_or(0);
                if !self.memory_cookies.remove(&cookie) {
                    log::debug!("Dropping memory contents for unknown cookie {}", cookie);
                    return;
                }
                self.events.emit(SessionEvent::Memory {
                    cookie,
                    address: value.get("address").map(Value::to_address).unwrap_or(0),
                    contents: value.get("contents").map(Value::hex_bytes).unwrap_or_default(),
                });
            }
            Response::Continuation(name) => match Continuation::from_str(&name) {
                Some(Continuation::RunEngine) => self.push_step(DeferredStep::ContinueRunEngine),
                Some(Continuation::UpdateAll) => self.push_step(DeferredStep::UpdateAll),
                Some(Continuation::UpdateLocals) => self.push_step(DeferredStep::UpdateLocals),
                Some(Continuation::ReloadRegisters) => self.push_step(DeferredStep::ReloadRegisters),
                Some(Continuation::SynchronizeBreakpoints) => {
                    self.push_step(DeferredStep::SynchronizeBreakpoints)
                }
                None => log::warn!("Unknown continuation '{}'", name),
            },
            Response::StatusMessage(message) => {
                let mut chars = message.chars();
                if let Some(first) = chars.next() {
                    let capitalized: String = first.to_uppercase().chain(chars).collect();
                    self.show_status_message(&capitalized);
                }
            }
            Response::FullBacktrace(value) => {
                self.events.emit(SessionEvent::Output {
                    channel: OutputChannel::Backtrace,
                    text: value.hex_text(),
                });
            }
            Response::Pid(value) => self.notify_inferior_pid(value.to_int()),
        }
    }

    fn set_stack_position(&mut self, index: usize) {
        self.sinks.stack.set_current_index(index);
        if let Some(frame) = self.sinks.stack.frame_at(index).cloned() {
            self.goto_frame(&frame);
        }
    }

    /// Map a `state` tag to its notification.
    fn handle_state(&mut self, state: &str) {
        match state {
            "running" => self.notify_inferior_run_ok(),
            "inferiorrunfailed" => self.notify_inferior_run_failed(),
            "stopped" => {
                self.notify_inferior_spontaneous_stop();
                if self.state != SessionState::InferiorStopOk {
                    return;
                }
                if self.continue_at_next_spontaneous_stop {
                    self.continue_at_next_spontaneous_stop = false;
                    if let Err(e) = self.request_continue() {
                        log::warn!("Cannot continue after attach: {}", e);
                    }
                } else {
                    self.push_step(DeferredStep::UpdateAll);
                }
            }
            "inferiorstopok" => self.notify_inferior_stop_ok(),
            "inferiorstopfailed" => self.notify_inferior_stop_failed(),
            "inferiorill" => self.notify_inferior_ill(),
            "enginesetupok" => self.notify_engine_setup_ok(),
            "enginesetupfailed" => self.notify_engine_setup_failed(),
            "enginerunfailed" => self.notify_engine_run_failed(),
            "inferiorsetupok" => self.notify_inferior_setup_ok(),
            "inferiorsetupfailed" => self.notify_inferior_setup_failed(),
            "enginerunandinferiorrunok" => {
                if self.params.continue_after_attach {
                    self.continue_at_next_spontaneous_stop = true;
                }
                self.notify_engine_run_and_inferior_run_ok();
            }
            "enginerunandinferiorstopok" => self.notify_engine_run_and_inferior_stop_ok(),
            "inferiorshutdownok" => self.notify_inferior_shutdown_ok(),
            "inferiorshutdownfailed" => self.notify_inferior_shutdown_failed(),
            "engineshutdownok" => self.notify_engine_shutdown_ok(),
            "engineshutdownfailed" => self.notify_engine_shutdown_failed(),
            "inferiorexited" => self.notify_inferior_exited(),
            "inferiorunrunnable" => self.notify_inferior_unrunnable(),
            other => log::warn!("Unknown state notification '{}'", other),
        }
    }
}

impl std::fmt::Debug for DebuggerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebuggerEngine")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("target_state", &self.target_state)
            .field("deferred", &self.deferred)
            .finish()
    }
}
