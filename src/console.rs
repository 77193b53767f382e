/// Console command parsing
///
/// Turns one line typed on stdin into a session request. Commands follow
/// the usual debugger shorthand (`c`, `s`, `n`, `bt`, ...).

use debugengine::{BreakpointId, BreakpointLocation, BreakpointParameters, SessionRequest};
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConsoleError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Invalid number: {0}")]
    InvalidNumber(String),
    #[error("Invalid location: {0}")]
    InvalidLocation(String),
}

pub type Result<T> = std::result::Result<T, ConsoleError>;

pub const HELP: &str = "\
run | c(ontinue) | s(tep) | si | n(ext) | ni | finish | interrupt
until <file:line|function> | jump <file:line>
break <file:line|function|0xaddr> [if <condition>] | tbreak <...> | delete <id>
frame <n> | thread <id> | bt | fullbt | regs | modules | symbols <module>
watch <expr> | unwatch <iname> | set <expr> = <value> | setreg <name> <value>
disas <addr> [function] | mem <addr> <length> | raw <command>
restart | quit | kill";

fn parse_number(text: &str) -> Result<u64> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| ConsoleError::InvalidNumber(text.to_string()))
}

fn parse_location(text: &str) -> Result<BreakpointLocation> {
    BreakpointLocation::parse(text).map_err(|_| ConsoleError::InvalidLocation(text.to_string()))
}

fn parse_file_line(text: &str) -> Result<(String, u32)> {
    match parse_location(text)? {
        BreakpointLocation::FileAndLine { file, line } => Ok((file, line)),
        _ => Err(ConsoleError::InvalidLocation(text.to_string())),
    }
}

fn parse_breakpoint(rest: &str) -> Result<BreakpointParameters> {
    let re = Regex::new(r"^(\S+)(?:\s+if\s+(.+))?$").map_err(|_| ConsoleError::Usage("break <location>"))?;
    let caps = re.captures(rest).ok_or(ConsoleError::Usage("break <location> [if <condition>]"))?;
    let mut params = BreakpointParameters::new(parse_location(&caps[1])?);
    if let Some(condition) = caps.get(2) {
        params = params.with_condition(condition.as_str().trim());
    }
    Ok(params)
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<SessionRequest>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    let request = match (command, rest) {
        ("run" | "r", "") => SessionRequest::Run,
        ("continue" | "c", "") => SessionRequest::Continue,
        ("step" | "s", "") => SessionRequest::Step,
        ("stepi" | "si", "") => SessionRequest::StepInstruction,
        ("next" | "n", "") => SessionRequest::Next,
        ("nexti" | "ni", "") => SessionRequest::NextInstruction,
        ("finish" | "out", "") => SessionRequest::StepOut,
        ("interrupt" | "int", "") => SessionRequest::Interrupt,
        ("quit" | "q", "") => SessionRequest::Shutdown,
        ("kill", "") => SessionRequest::Abort,
        ("restart", "") => SessionRequest::Restart,
        ("bt" | "where", "") => SessionRequest::ReloadFullStack,
        ("fullbt", "") => SessionRequest::FullBacktrace,
        ("regs" | "registers", "") => SessionRequest::ReloadRegisters,
        ("modules", "") => SessionRequest::ReloadModules,
        ("until" | "u", target) if !target.is_empty() => match parse_location(target)? {
            BreakpointLocation::FileAndLine { file, line } => SessionRequest::RunToLine { file, line },
            BreakpointLocation::Function(function) => SessionRequest::RunToFunction(function),
            BreakpointLocation::Address(_) => return Err(ConsoleError::Usage("until <file:line|function>")),
        },
        ("jump", target) if !target.is_empty() => {
            let (file, line) = parse_file_line(target)?;
            SessionRequest::JumpToLine { file, line }
        }
        ("break" | "b", target) if !target.is_empty() => SessionRequest::InsertBreakpoint(parse_breakpoint(target)?),
        ("tbreak", target) if !target.is_empty() => {
            SessionRequest::InsertBreakpoint(parse_breakpoint(target)?.one_shot())
        }
        ("delete" | "d", id) if !id.is_empty() => SessionRequest::RemoveBreakpoint(BreakpointId::from(id)),
        ("frame" | "f", index) if !index.is_empty() => {
            let index = index
                .parse()
                .map_err(|_| ConsoleError::InvalidNumber(index.to_string()))?;
            SessionRequest::ActivateFrame(index)
        }
        ("thread", id) if !id.is_empty() => SessionRequest::SelectThread(id.to_string()),
        ("symbols", module) if !module.is_empty() => SessionRequest::ModuleSymbols(module.to_string()),
        ("watch", expression) if !expression.is_empty() => SessionRequest::AddWatcher(expression.to_string()),
        ("unwatch", iname) if !iname.is_empty() => SessionRequest::RemoveWatcher(iname.to_string()),
        ("set", assignment) => {
            let (expression, value) = assignment
                .split_once('=')
                .ok_or(ConsoleError::Usage("set <expr> = <value>"))?;
            let (expression, value) = (expression.trim(), value.trim());
            if expression.is_empty() || value.is_empty() {
                return Err(ConsoleError::Usage("set <expr> = <value>"));
            }
            SessionRequest::AssignValue {
                expression: expression.to_string(),
                value: value.to_string(),
            }
        }
        ("setreg", args) => {
            let (name, value) = args
                .split_once(char::is_whitespace)
                .ok_or(ConsoleError::Usage("setreg <name> <value>"))?;
            SessionRequest::SetRegister {
                name: name.to_string(),
                value: value.trim().to_string(),
            }
        }
        ("disas" | "disassemble", args) if !args.is_empty() => {
            let mut parts = args.split_whitespace();
            let address = parse_number(parts.next().unwrap_or_default())?;
            let function = parts.next().unwrap_or_default().to_string();
            SessionRequest::Disassemble { address, function }
        }
        ("mem" | "x", args) => {
            let parts: Vec<&str> = args.split_whitespace().collect();
            match parts.as_slice() {
                [address, length] => SessionRequest::FetchMemory {
                    address: parse_number(address)?,
                    length: parse_number(length)?,
                },
                _ => return Err(ConsoleError::Usage("mem <addr> <length>")),
            }
        }
        ("raw", command) if !command.is_empty() => SessionRequest::DebuggerCommand(command.to_string()),
        _ => return Err(ConsoleError::UnknownCommand(line.to_string())),
    };
    Ok(Some(request))
}
