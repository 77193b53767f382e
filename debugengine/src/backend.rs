/// Backend adapters
///
/// The session engine talks to a backend only through the `Backend` trait.
/// `BridgeBackend` speaks the JSON command protocol of a scripted debugger
/// bridge.

use bitflags::bitflags;

use crate::breakpoints::Breakpoint;
use crate::commands::{to_hex, Command};
use crate::communication::Correlator;
use crate::types::{SessionParameters, StartMode};
use crate::Result;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const REVERSE_STEPPING = 1 << 0;
        const AUTO_DEREF_POINTERS = 1 << 1;
        const DISASSEMBLER = 1 << 2;
        const REGISTER = 1 << 3;
        const SHOW_MEMORY = 1 << 4;
        const JUMP_TO_LINE = 1 << 5;
        const RELOAD_MODULE = 1 << 6;
        const RELOAD_MODULE_SYMBOLS = 1 << 7;
        const BREAK_ON_THROW_AND_CATCH = 1 << 8;
        const BREAK_CONDITION = 1 << 9;
        const TRACE_POINT = 1 << 10;
        const RETURN_FROM_FUNCTION = 1 << 11;
        const CREATE_FULL_BACKTRACE = 1 << 12;
        const ADD_WATCHER = 1 << 13;
        const SHOW_MODULE_SYMBOLS = 1 << 14;
        const OPERATE_BY_INSTRUCTION = 1 << 15;
        const RUN_TO_LINE = 1 << 16;
        const MEMORY_ADDRESS = 1 << 17;
        const SNAPSHOT = 1 << 18;
    }
}

/// Execution requests that resume the inferior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecCommand {
    Step,
    StepI,
    Next,
    NextI,
    StepOut,
    Continue,
    RunToLine { file: String, line: u32, address: u64 },
    RunToFunction(String),
    JumpToLine { file: String, line: u32, address: u64 },
}

impl ExecCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ExecCommand::Step => "executeStep",
            ExecCommand::StepI => "executeStepI",
            ExecCommand::Next => "executeNext",
            ExecCommand::NextI => "executeNextI",
            ExecCommand::StepOut => "executeStepOut",
            ExecCommand::Continue => "continueInferior",
            ExecCommand::RunToLine { .. } => "executeRunToLocation",
            ExecCommand::RunToFunction(_) => "executeRunToFunction",
            ExecCommand::JumpToLine { .. } => "executeJumpToLocation",
        }
    }

    /// Capability the backend must report before this request is allowed.
    pub fn required_capability(&self) -> Capabilities {
        match self {
            ExecCommand::StepI | ExecCommand::NextI => Capabilities::OPERATE_BY_INSTRUCTION,
            ExecCommand::RunToLine { .. } | ExecCommand::RunToFunction(_) => Capabilities::RUN_TO_LINE,
            ExecCommand::JumpToLine { .. } => Capabilities::JUMP_TO_LINE,
            _ => Capabilities::empty(),
        }
    }

    pub fn to_command(&self) -> Command {
        let command = Command::new(self.name());
        match self {
            ExecCommand::RunToLine { file, line, address } | ExecCommand::JumpToLine { file, line, address } => command
                .arg("file", file.as_str())
                .arg("line", *line)
                .arg("address", *address),
            ExecCommand::RunToFunction(function) => command.arg("function", function.as_str()),
            _ => command,
        }
    }
}

impl std::fmt::Display for ExecCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Capability interface implemented by each backend kind.
///
/// Every call is made from a deferred step in the matching session state.
/// An `Err` return is treated as a failure of that step.
pub trait Backend: Send {
    fn name(&self) -> &str;

    fn capabilities(&self, params: &SessionParameters) -> Capabilities;

    fn accepts_breakpoint(&self, _breakpoint: &Breakpoint, _params: &SessionParameters) -> bool {
        true
    }

    fn setup_engine(&mut self, link: &mut Correlator, params: &SessionParameters) -> Result<()>;

    fn setup_inferior(&mut self, link: &mut Correlator, params: &SessionParameters) -> Result<()>;

    fn run_engine(&mut self, link: &mut Correlator) -> Result<()>;

    fn interrupt_inferior(&mut self, link: &mut Correlator) -> Result<()>;

    fn execute(&mut self, link: &mut Correlator, command: &ExecCommand) -> Result<()>;

    fn shutdown_inferior(&mut self, link: &mut Correlator) -> Result<()>;

    fn shutdown_engine(&mut self, link: &mut Correlator) -> Result<()>;
}

/// Adapter for the scripted bridge. The bridge reports progress with
/// `state` blocks; this side only writes commands.
#[derive(Debug, Default)]
pub struct BridgeBackend;

impl BridgeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for BridgeBackend {
    fn name(&self) -> &str {
        "bridge"
    }

    fn capabilities(&self, params: &SessionParameters) -> Capabilities {
        let all = Capabilities::REVERSE_STEPPING
            | Capabilities::AUTO_DEREF_POINTERS
            | Capabilities::DISASSEMBLER
            | Capabilities::REGISTER
            | Capabilities::SHOW_MEMORY
            | Capabilities::JUMP_TO_LINE
            | Capabilities::RELOAD_MODULE
            | Capabilities::RELOAD_MODULE_SYMBOLS
            | Capabilities::BREAK_ON_THROW_AND_CATCH
            | Capabilities::BREAK_CONDITION
            | Capabilities::TRACE_POINT
            | Capabilities::RETURN_FROM_FUNCTION
            | Capabilities::CREATE_FULL_BACKTRACE
            | Capabilities::ADD_WATCHER
            | Capabilities::SHOW_MODULE_SYMBOLS
            | Capabilities::OPERATE_BY_INSTRUCTION
            | Capabilities::RUN_TO_LINE
            | Capabilities::MEMORY_ADDRESS;

        // A core file cannot be resumed.
        if params.start_mode == StartMode::CoreFile {
            all - Capabilities::RUN_TO_LINE - Capabilities::JUMP_TO_LINE
        } else {
            all
        }
    }

    fn accepts_breakpoint(&self, _breakpoint: &Breakpoint, params: &SessionParameters) -> bool {
        params.start_mode != StartMode::CoreFile
    }

    fn setup_engine(&mut self, link: &mut Correlator, params: &SessionParameters) -> Result<()> {
        let mut command = Command::new("setupEngine");
        if !params.tool_chain.id.is_empty() {
            command.push_arg("toolChain", params.tool_chain.id.as_str());
        }
        link.send(command)?;
        Ok(())
    }

    fn setup_inferior(&mut self, link: &mut Correlator, params: &SessionParameters) -> Result<()> {
        let remote_channel = match params.start_mode {
            StartMode::Remote => params.remote_channel.clone().unwrap_or_default(),
            _ => String::new(),
        };
        let path_arg = |path: &Option<std::path::PathBuf>| {
            path.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };

        let command = Command::new("setupInferior")
            .arg("executable", params.executable.display().to_string())
            .arg("breakOnMain", params.break_at_main)
            .arg("useTerminal", params.use_terminal)
            .arg("startMode", params.start_mode.to_string())
            .list("processArgs", params.args.iter().map(|arg| to_hex(arg)))
            .arg("attachPid", params.attach_pid.map(i64::from).unwrap_or(0))
            .arg("coreFile", path_arg(&params.core_file))
            .arg("sysRoot", path_arg(&params.sys_root))
            .arg("remoteChannel", remote_channel)
            .arg("platform", params.platform.clone().unwrap_or_default())
            .arg("workingDirectory", path_arg(&params.working_dir));
        link.send(command)?;
        Ok(())
    }

    fn run_engine(&mut self, link: &mut Correlator) -> Result<()> {
        link.send(Command::new("runEngine"))?;
        Ok(())
    }

    fn interrupt_inferior(&mut self, link: &mut Correlator) -> Result<()> {
        link.send(Command::new("interruptInferior"))?;
        Ok(())
    }

    fn execute(&mut self, link: &mut Correlator, command: &ExecCommand) -> Result<()> {
        link.send(command.to_command())?;
        Ok(())
    }

    fn shutdown_inferior(&mut self, link: &mut Correlator) -> Result<()> {
        link.send(Command::new("shutdownInferior"))?;
        Ok(())
    }

    fn shutdown_engine(&mut self, link: &mut Correlator) -> Result<()> {
        // The process goes away once the link closes; a dead link is fine.
        if let Err(e) = link.send(Command::new("shutdownEngine")) {
            log::debug!("shutdownEngine not delivered: {}", e);
        }
        Ok(())
    }
}
