use clap::Parser;
use debugengine::config::load_parameters;
use debugengine::{
    run_event_loop, spawn_backend, BreakHandler, BridgeBackend, DebuggerEngine, EngineId, OutputChannel,
    SessionConfig, SessionEvent, SessionParameters, SessionRequest, StartMode,
};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

mod console;

/// Drive a debugger backend from the terminal.
#[derive(Parser, Debug)]
#[command(name = "dbgctl", version, about)]
struct Cli {
    /// Session config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session parameters file (JSON). Overrides the target arguments.
    #[arg(short, long)]
    params: Option<PathBuf>,

    /// Attach to a running process instead of launching
    #[arg(short, long, conflicts_with = "core")]
    attach: Option<u32>,

    /// Open a core file for post-mortem inspection
    #[arg(long)]
    core: Option<PathBuf>,

    /// Stop at the program's entry function
    #[arg(long)]
    break_at_main: bool,

    /// Resume the inferior after attaching
    #[arg(long)]
    continue_after_attach: bool,

    /// Verbose engine logging
    #[arg(short, long)]
    verbose: bool,

    /// Program to debug
    #[arg(required_unless_present_any = ["attach", "params", "core"])]
    executable: Option<PathBuf>,

    /// Arguments passed to the program
    #[arg(last = true)]
    args: Vec<String>,
}

impl Cli {
    fn session_parameters(&self) -> debugengine::Result<SessionParameters> {
        if let Some(path) = &self.params {
            return Ok(load_parameters(path)?);
        }
        let mut params = match self.attach {
            Some(pid) => SessionParameters::attach(pid),
            None => SessionParameters::launch(self.executable.clone().unwrap_or_default()),
        };
        if let Some(core) = &self.core {
            params.start_mode = StartMode::CoreFile;
            params.core_file = Some(core.clone());
        }
        if let Some(executable) = &self.executable {
            params.executable = executable.clone();
        }
        if params.start_mode == StartMode::Launch {
            params.args = self.args.clone();
        }
        params.break_at_main = self.break_at_main;
        params.continue_after_attach = self.continue_after_attach;
        Ok(params)
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged { from, to, forced } => {
                log::debug!("{} -> {}{}", from, to, if forced { " (forced)" } else { "" });
            }
            SessionEvent::StatusMessage(message) => log::info!("{}", message),
            SessionEvent::Output { channel, text } => match channel {
                OutputChannel::AppOutput | OutputChannel::AppStuff | OutputChannel::Backtrace => print!("{}", text),
                OutputChannel::AppError => eprint!("{}", text),
                OutputChannel::DebuggerStderr => log::warn!("{}", text.trim_end()),
            },
            SessionEvent::Location(location) if location.use_assembler => {
                println!("Stopped at 0x{:x}", location.address);
            }
            SessionEvent::Location(location) => println!("Stopped at {}:{}", location.file, location.line),
            SessionEvent::Failure(kind) => log::error!("{}", kind),
            SessionEvent::InferiorPid(pid) => log::info!("Inferior pid {}", pid),
            SessionEvent::Finished => log::info!("Session finished. Type 'restart' or 'quit'."),
            other => log::trace!("{:?}", other),
        }
    }
}

async fn read_console(requests: mpsc::UnboundedSender<SessionRequest>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read stdin: {}", e);
                break;
            }
        };
        if line.trim() == "help" {
            println!("{}", console::HELP);
            continue;
        }
        match console::parse_line(&line) {
            Ok(Some(request)) => {
                if requests.send(request).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => println!("{}", e),
        }
    }
    log::debug!("Console closed");
}

async fn run(cli: Cli) -> debugengine::Result<()> {
    let config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    let params = cli.session_parameters()?;

    let (outbound, mut backend) = spawn_backend(&config, &params)?;
    let mut engine = DebuggerEngine::new(
        EngineId(1),
        Box::new(BridgeBackend::new()),
        outbound,
        config.clone(),
        BreakHandler::shared(),
    );
    tokio::spawn(print_events(engine.subscribe()));

    let (requests_tx, mut requests) = mpsc::unbounded_channel();
    tokio::spawn(read_console(requests_tx));

    engine.start_setup(params)?;
    loop {
        run_event_loop(&mut engine, &mut backend, &mut requests).await;

        // A finished session only accepts restart or quit.
        loop {
            match requests.recv().await {
                Some(SessionRequest::Restart) => break,
                Some(SessionRequest::Shutdown | SessionRequest::Abort) | None => return Ok(()),
                Some(request) => log::info!("Ignoring {:?}, the session has finished", request),
            }
        }

        let (outbound, events) = spawn_backend(&config, engine.params())?;
        backend = events;
        engine.reconnect(outbound);
        let params = engine.params().clone();
        engine.start_setup(params)?;
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let engine_level = if cli.verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };

    // Initialize the logger first
    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("debugengine", engine_level)
        .init()
    {
        eprintln!("Failed to initialize logger: {}", e);
    }

    log::info!("dbgctl starting...");

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{}", e);
            1
        }
    };

    log::info!("Exited with code: {exit_code}");
    std::process::exit(exit_code);
}
