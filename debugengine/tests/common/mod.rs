#![allow(dead_code)]

/// Scripted in-memory backend for driving an engine without a process.
///
/// Commands the engine writes are captured from the link channel; replies
/// are fed back as raw bytes the way the process reader delivers them.
use debugengine::*;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

pub struct Harness {
    pub engine: DebuggerEngine,
    outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(SessionConfig::default(), BreakHandler::shared())
    }

    pub fn with(config: SessionConfig, breakpoints: SharedBreakHandler) -> Self {
        Self::with_id(EngineId(1), config, breakpoints)
    }

    pub fn with_id(id: EngineId, config: SessionConfig, breakpoints: SharedBreakHandler) -> Self {
        let (tx, outbound) = mpsc::unbounded_channel();
        let mut engine = DebuggerEngine::new(id, Box::new(BridgeBackend::new()), tx, config, breakpoints);
        let events = engine.subscribe();
        Self {
            engine,
            outbound,
            events,
        }
    }

    /// Run deferred steps until the queue is empty.
    pub fn settle(&mut self) {
        for _ in 0..100 {
            if self.engine.run_deferred() == 0 {
                return;
            }
        }
        panic!("deferred queue never drained");
    }

    /// Drain and parse every command written so far.
    pub fn sent(&mut self) -> Vec<JsonValue> {
        let mut commands = Vec::new();
        while let Ok(line) = self.outbound.try_recv() {
            assert!(line.ends_with('\n'), "command not newline terminated: {:?}", line);
            commands.push(serde_json::from_str(line.trim_end()).unwrap());
        }
        commands
    }

    pub fn sent_names(&mut self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|command| command["cmd"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    /// Feed one block from the backend and let the engine react.
    pub fn reply(&mut self, block: &str) {
        self.engine.handle_backend_output(format!("{}@\n", block).as_bytes());
        self.settle();
    }

    pub fn state_reply(&mut self, state: &str) {
        self.reply(&format!("{{\"state\":\"{}\"}}", state));
    }

    pub fn events(&mut self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    pub fn states(&mut self) -> Vec<SessionState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    /// Start a launch session and walk it to `InferiorStopOk`.
    pub fn stopped() -> Self {
        let mut harness = Self::new();
        harness.walk_to_stop();
        harness.sent();
        harness.events();
        harness
    }

    /// Drive setup to `InferiorStopOk`, leaving commands and events unread.
    pub fn walk_to_stop(&mut self) {
        self.engine.start_setup(SessionParameters::launch("/bin/app")).unwrap();
        self.settle();
        self.state_reply("enginesetupok");
        self.state_reply("inferiorsetupok");
        self.state_reply("enginerunandinferiorstopok");
        assert_eq!(self.engine.state(), SessionState::InferiorStopOk);
    }
}
