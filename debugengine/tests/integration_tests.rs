/// Integration tests for the session controller
///
/// These drive a full engine against a scripted backend: commands are read
/// back from the link channel and replies are fed in as raw blocks.

mod common;

use common::Harness;
use debugengine::breakpoints::BreakpointState;
use debugengine::*;
use pretty_assertions::assert_eq;

#[test]
fn test_setup_to_running_pipeline() {
    let mut harness = Harness::new();
    harness.engine.start_setup(SessionParameters::launch("/bin/app")).unwrap();
    harness.settle();
    assert_eq!(harness.sent_names(), vec!["setupEngine"]);

    harness.state_reply("enginesetupok");
    assert_eq!(harness.engine.state(), SessionState::InferiorSetupRequested);
    let setup = harness.sent();
    assert_eq!(setup.len(), 1);
    assert_eq!(setup[0]["cmd"], "setupInferior");
    assert_eq!(setup[0]["executable"], "/bin/app");

    harness.state_reply("inferiorsetupok");
    assert_eq!(harness.engine.state(), SessionState::EngineRunRequested);
    assert_eq!(harness.sent_names(), vec!["runEngine"]);

    harness.state_reply("enginerunandinferiorrunok");
    assert_eq!(harness.engine.state(), SessionState::InferiorRunOk);
    assert_eq!(harness.engine.progress(), 1000);
    assert_eq!(harness.engine.unexpected_transitions(), 0);

    assert_eq!(
        harness.states(),
        vec![
            SessionState::EngineSetupRequested,
            SessionState::EngineSetupOk,
            SessionState::InferiorSetupRequested,
            SessionState::InferiorSetupOk,
            SessionState::EngineRunRequested,
            SessionState::InferiorRunRequested,
            SessionState::InferiorRunOk,
        ]
    );
}

#[test]
fn test_mi_style_blocks_drive_the_same_pipeline() {
    let mut harness = Harness::new();
    harness.engine.start_setup(SessionParameters::launch("/bin/app")).unwrap();
    harness.settle();
    harness.reply("state=\"enginesetupok\"");
    harness.reply("state=\"inferiorsetupok\"");
    harness.reply("state=\"enginerunandinferiorrunok\"");
    assert_eq!(harness.engine.state(), SessionState::InferiorRunOk);
}

#[test]
fn test_breakpoint_insert_acknowledged() {
    let mut harness = Harness::stopped();
    let handler = harness.engine.breakpoints();
    handler
        .lock()
        .add("B1".into(), BreakpointParameters::at_file_line("file.cpp", 10))
        .unwrap();

    assert!(!harness.engine.attempt_breakpoint_synchronization());
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["cmd"], "handleBreakpoints");
    let ops = sent[0]["bkpts"].as_array().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["operation"], "add");
    assert_eq!(ops[0]["modelid"], "B1");
    assert_eq!(ops[0]["file"], "file.cpp");
    assert_eq!(ops[0]["line"], 10);
    assert_eq!(
        handler.lock().get(&"B1".into()).unwrap().state(),
        BreakpointState::InsertProceeding
    );

    harness.reply(r#"{"breakpoint-added":{"modelid":"B1","lldbid":"42","line":10}}"#);
    let guard = handler.lock();
    let bp = guard.get(&"B1".into()).unwrap();
    assert_eq!(bp.state(), BreakpointState::Inserted);
    assert_eq!(bp.response().id.0, "42");
    assert_eq!(bp.response().line, 10);
    drop(guard);

    assert!(harness
        .events()
        .contains(&SessionEvent::BreakpointResponseChanged("B1".into())));
}

#[test]
fn test_engine_ill_while_running_interrupts_first() {
    let mut harness = Harness::stopped();
    harness.engine.request_continue().unwrap();
    harness.settle();
    harness.state_reply("running");
    assert_eq!(harness.engine.state(), SessionState::InferiorRunOk);
    harness.sent();
    harness.events();

    harness.engine.notify_engine_ill();
    assert_eq!(harness.states(), vec![SessionState::InferiorStopRequested]);

    harness.settle();
    assert_eq!(harness.sent_names(), vec!["interruptInferior"]);

    harness.state_reply("inferiorstopok");
    assert_eq!(harness.engine.state(), SessionState::InferiorShutdownRequested);
    assert_eq!(harness.sent_names(), vec!["shutdownInferior"]);

    harness.state_reply("inferiorshutdownok");
    assert_eq!(harness.engine.state(), SessionState::Finished);
    assert_eq!(harness.sent_names(), vec!["shutdownEngine"]);
}

#[test]
fn test_two_removals_share_one_command() {
    let mut harness = Harness::stopped();
    let handler = harness.engine.breakpoints();
    {
        let mut handler = handler.lock();
        handler.add("B1".into(), BreakpointParameters::at_function("a")).unwrap();
        handler.add("B2".into(), BreakpointParameters::at_function("b")).unwrap();
    }
    harness.engine.attempt_breakpoint_synchronization();
    harness.reply(r#"{"breakpoint-added":{"modelid":"B1","lldbid":"1"}}"#);
    harness.reply(r#"{"breakpoint-added":{"modelid":"B2","lldbid":"2"}}"#);
    harness.sent();

    handler.lock().remove(&"B1".into()).unwrap();
    handler.lock().remove(&"B2".into()).unwrap();
    harness.engine.request_breakpoint_synchronization();
    harness.settle();

    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    let ops = sent[0]["bkpts"].as_array().unwrap();
    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(|op| op["operation"] == "remove"));
    assert_eq!(ops[0]["lldbid"], "1");
    assert_eq!(ops[1]["lldbid"], "2");

    harness.reply(r#"{"breakpoint-removed":{"modelid":"B1"}}"#);
    harness.reply(r#"{"breakpoint-removed":{"lldbid":"2"}}"#);
    assert!(handler.lock().is_empty());
}

#[test]
fn test_synchronization_is_idempotent() {
    let mut harness = Harness::stopped();
    harness
        .engine
        .breakpoints()
        .lock()
        .insert(BreakpointParameters::at_address(0x4000));

    assert!(!harness.engine.attempt_breakpoint_synchronization());
    assert_eq!(harness.sent().len(), 1);
    assert!(harness.engine.attempt_breakpoint_synchronization());
    assert!(harness.sent().is_empty());
}

#[test]
fn test_tokens_strictly_increase() {
    let mut harness = Harness::stopped();
    harness.engine.reload_registers().unwrap();
    harness.engine.reload_modules().unwrap();
    harness.engine.update_all().unwrap();
    harness.engine.request_step().unwrap();
    harness.settle();

    let tokens: Vec<u64> = harness
        .sent()
        .iter()
        .map(|command| command["token"].as_u64().unwrap())
        .collect();
    assert!(tokens.len() >= 5);
    assert!(tokens.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn test_initial_breakpoints_follow_inferior_setup() {
    let handler = BreakHandler::shared();
    handler.lock().insert(BreakpointParameters::at_file_line("main.c", 3));
    let mut harness = Harness::with(SessionConfig::default(), handler.clone());

    harness.engine.start_setup(SessionParameters::launch("/bin/app")).unwrap();
    harness.settle();
    harness.sent();

    harness.state_reply("enginesetupok");
    assert_eq!(harness.sent_names(), vec!["setupInferior", "handleBreakpoints"]);

    harness.reply(r#"{"breakpoint-added":{"modelid":"B1","lldbid":"7"}}"#);
    harness.state_reply("inferiorsetupok");
    assert_eq!(harness.sent_names(), vec!["runEngine"]);
}

#[test]
fn test_run_waits_for_late_breakpoints() {
    let handler = BreakHandler::shared();
    let mut harness = Harness::with(SessionConfig::default(), handler.clone());

    harness.engine.start_setup(SessionParameters::launch("/bin/app")).unwrap();
    harness.settle();
    harness.state_reply("enginesetupok");
    harness.sent();

    handler.lock().insert(BreakpointParameters::at_function("worker"));
    harness.state_reply("inferiorsetupok");
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["cmd"], "handleBreakpoints");
    assert_eq!(sent[0]["continuation"], "runEngine");
    let token = sent[0]["token"].as_u64().unwrap();

    harness.reply(&format!(
        r#"{{"breakpoint-added":{{"modelid":"B1","lldbid":"7"}},"continuation":"runEngine","token":{}}}"#,
        token
    ));
    assert_eq!(harness.sent_names(), vec!["runEngine"]);
    assert_eq!(harness.engine.state(), SessionState::EngineRunRequested);
    assert!(harness.engine.link().pending().all(|command| command.token != token));
}

#[test]
fn test_break_at_main_adds_function_breakpoint() {
    let mut harness = Harness::new();
    let mut params = SessionParameters::launch("/bin/app");
    params.break_at_main = true;
    harness.engine.start_setup(params).unwrap();

    let handler = harness.engine.breakpoints();
    let handler = handler.lock();
    assert_eq!(handler.len(), 1);
    let bp = handler.iter().next().unwrap();
    assert_eq!(bp.params().location, BreakpointLocation::Function("main".into()));
}

#[test]
fn test_spontaneous_stop_refreshes_views() {
    let mut harness = Harness::stopped();
    harness.engine.request_continue().unwrap();
    harness.settle();
    harness.state_reply("running");
    harness.sent();

    harness.state_reply("stopped");
    assert_eq!(harness.engine.state(), SessionState::InferiorStopOk);
    assert_eq!(
        harness.sent_names(),
        vec!["reportStack", "updateData", "reportRegisters"]
    );
}

#[test]
fn test_continue_after_attach() {
    let mut harness = Harness::new();
    let mut params = SessionParameters::attach(4711);
    params.continue_after_attach = true;
    harness.engine.start_setup(params).unwrap();
    assert_eq!(harness.engine.inferior_pid(), 4711);
    harness.settle();
    harness.state_reply("enginesetupok");
    harness.state_reply("inferiorsetupok");
    harness.state_reply("enginerunandinferiorrunok");
    harness.sent();

    harness.state_reply("stopped");
    assert_eq!(harness.engine.state(), SessionState::InferiorRunRequested);
    assert_eq!(harness.sent_names(), vec!["continueInferior"]);

    // Only the first stop is skipped.
    harness.state_reply("running");
    harness.state_reply("stopped");
    assert_eq!(harness.engine.state(), SessionState::InferiorStopOk);
}

#[test]
fn test_inferior_exit_finishes_session() {
    let mut harness = Harness::stopped();
    harness.engine.request_continue().unwrap();
    harness.settle();
    harness.state_reply("running");
    harness.sent();

    harness.state_reply("inferiorexited");
    assert_eq!(harness.engine.state(), SessionState::Finished);
    assert_eq!(harness.sent_names(), vec!["shutdownEngine"]);
    assert_eq!(harness.engine.unexpected_transitions(), 0);
    assert!(harness.events().contains(&SessionEvent::Finished));
}

#[test]
fn test_shutdown_from_every_reachable_state() {
    let scripts: Vec<(SessionState, Vec<&str>)> = vec![
        (SessionState::EngineSetupRequested, vec![]),
        (SessionState::InferiorSetupRequested, vec!["enginesetupok"]),
        (SessionState::EngineRunRequested, vec!["enginesetupok", "inferiorsetupok"]),
        (
            SessionState::InferiorRunOk,
            vec!["enginesetupok", "inferiorsetupok", "enginerunandinferiorrunok"],
        ),
        (
            SessionState::InferiorStopOk,
            vec!["enginesetupok", "inferiorsetupok", "enginerunandinferiorstopok"],
        ),
        (
            SessionState::InferiorUnrunnable,
            vec!["enginesetupok", "inferiorsetupok", "inferiorunrunnable"],
        ),
    ];

    for (expected, replies) in scripts {
        let mut harness = Harness::new();
        harness.engine.start_setup(SessionParameters::launch("/bin/app")).unwrap();
        harness.settle();
        for state in replies {
            harness.state_reply(state);
        }
        assert_eq!(harness.engine.state(), expected);

        harness.engine.request_shutdown();
        harness.settle();
        for _ in 0..10 {
            match harness.engine.state() {
                SessionState::Finished => break,
                SessionState::InferiorStopRequested => harness.state_reply("inferiorstopok"),
                SessionState::InferiorShutdownRequested => harness.state_reply("inferiorshutdownok"),
                other => panic!("stuck in {} starting from {}", other, expected),
            }
        }
        assert_eq!(harness.engine.state(), SessionState::Finished, "from {}", expected);
    }
}

#[test]
fn test_backend_crash_is_reported_once() {
    let mut harness = Harness::stopped();
    harness.engine.handle_backend_exited(Some(139));
    harness.engine.handle_backend_exited(Some(139));
    harness.settle();

    assert_eq!(harness.engine.state(), SessionState::Finished);
    let failures: Vec<_> = harness
        .events()
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::Failure(_)))
        .collect();
    assert_eq!(failures, vec![SessionEvent::Failure(FailureKind::EngineCrashed)]);
    assert_eq!(harness.engine.progress(), 900);
}

#[test]
fn test_late_output_after_finish_is_ignored() {
    let mut harness = Harness::stopped();
    harness.engine.abort();
    harness.engine.abort();
    harness.settle();
    harness.events();

    harness.state_reply("enginesetupok");
    assert_eq!(harness.engine.state(), SessionState::Finished);
    assert!(harness.events().is_empty());
}

#[test]
fn test_restart_after_finish() {
    let mut harness = Harness::stopped();
    harness.engine.abort();
    harness.engine.abort();
    harness.settle();
    let last_token = harness.engine.link().last_token();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    harness.engine.reconnect(tx);
    harness.engine.start_setup(SessionParameters::launch("/bin/app")).unwrap();
    harness.settle();
    assert_eq!(harness.engine.state(), SessionState::EngineSetupRequested);

    let line = rx.try_recv().unwrap();
    let command: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(command["cmd"], "setupEngine");
    assert!(command["token"].as_u64().unwrap() > last_token);
}

#[test]
fn test_unknown_tags_and_malformed_blocks_are_ignored() {
    let mut harness = Harness::stopped();
    harness.reply(r#"{"frobnicate":"1"}"#);
    harness.reply(r#"state="stop"#);
    harness.reply(r#"{"state":"bogus"}"#);
    assert_eq!(harness.engine.state(), SessionState::InferiorStopOk);
    assert_eq!(harness.engine.unexpected_transitions(), 0);
}

#[test]
fn test_data_sinks_are_fed() {
    let mut harness = Harness::stopped();
    harness.reply(
        r#"stack={frames=[{level="0",func="main",file="main.c",line="12",addr="0x401000"},{level="1",func="__libc_start_main",addr="0x7f00"}],hasmore="1"}"#,
    );
    harness.reply(r#"threads={threads=[{id="1",name="app",state="stopped"}],current-thread-id="1"}"#);
    harness.reply(r#"stack-position={id="0"}"#);

    let sinks = harness.engine.sinks();
    assert_eq!(sinks.stack.stack_size(), 2);
    assert!(sinks.stack.can_expand());
    assert_eq!(sinks.threads.current_id(), Some("1"));

    let location = harness.engine.location().unwrap();
    assert_eq!(location.file, "main.c");
    assert_eq!(location.line, 12);
    assert!(!location.use_assembler);

    let events = harness.events();
    assert!(events.contains(&SessionEvent::DataUpdated(sinks::SinkKind::Stack)));
    assert!(events.contains(&SessionEvent::DataUpdated(sinks::SinkKind::Threads)));
}

#[test]
fn test_replies_with_unknown_cookies_are_dropped() {
    let mut harness = Harness::stopped();
    let cookie = harness.engine.fetch_disassembler(0x401000, "main").unwrap();
    harness.events();

    harness.reply(r#"disassembly={cookie="999",lines=[]}"#);
    assert!(harness.events().is_empty());

    harness.reply(&format!(
        r#"disassembly={{cookie="{}",lines=[{{address="0x401000",inst="push rbp",func-name="main",offset="0"}}]}}"#,
        cookie
    ));
    let events = harness.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        SessionEvent::Disassembly { cookie: got, lines } => {
            assert_eq!(*got, cookie);
            assert_eq!(lines[0].instruction, "push rbp");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_output_and_status_messages() {
    let mut harness = Harness::stopped();
    harness.reply(&format!(
        r#"output={{channel="stdout",data="{}"}}"#,
        commands::to_hex("hello\n")
    ));
    harness.reply(r#"statusmessage="stopped at breakpoint""#);

    let events = harness.events();
    assert_eq!(
        events,
        vec![
            SessionEvent::Output {
                channel: OutputChannel::AppOutput,
                text: "hello\n".to_string(),
            },
            SessionEvent::StatusMessage("Stopped at breakpoint".to_string()),
        ]
    );
}

fn breakpoint_batches(sent: &[serde_json::Value]) -> Vec<Vec<String>> {
    sent.iter()
        .filter(|command| command["cmd"] == "handleBreakpoints")
        .map(|command| {
            command["bkpts"]
                .as_array()
                .unwrap()
                .iter()
                .map(|op| op["modelid"].as_str().unwrap_or_default().to_string())
                .collect()
        })
        .collect()
}

#[test]
fn test_engines_sharing_breakpoints_only_touch_their_own() {
    let handler = BreakHandler::shared();
    handler.lock().add("B1".into(), BreakpointParameters::at_function("a")).unwrap();

    let mut first = Harness::with_id(EngineId(1), SessionConfig::default(), handler.clone());
    first.walk_to_stop();
    assert_eq!(breakpoint_batches(&first.sent()), vec![vec!["B1".to_string()]]);
    first.reply(r#"{"breakpoint-added":{"modelid":"B1","lldbid":"1"}}"#);

    handler.lock().add("B2".into(), BreakpointParameters::at_function("b")).unwrap();
    let mut second = Harness::with_id(EngineId(2), SessionConfig::default(), handler.clone());
    second.walk_to_stop();
    assert_eq!(breakpoint_batches(&second.sent()), vec![vec!["B2".to_string()]]);
    // Both backends hand out id 1.
    second.reply(r#"{"breakpoint-added":{"modelid":"B2","lldbid":"1"}}"#);
    assert_eq!(handler.lock().engine_ids(EngineId(1)), vec![BreakpointId::from("B1")]);
    assert_eq!(handler.lock().engine_ids(EngineId(2)), vec![BreakpointId::from("B2")]);

    handler.lock().remove(&"B2".into()).unwrap();
    second.engine.request_breakpoint_synchronization();
    second.settle();
    let sent = second.sent();
    assert_eq!(sent[0]["bkpts"][0]["lldbid"], "1");
    second.reply(r#"{"breakpoint-removed":{"lldbid":"1"}}"#);

    let guard = handler.lock();
    assert!(guard.get(&"B2".into()).is_none());
    let bp = guard.get(&"B1".into()).unwrap();
    assert_eq!(bp.state(), BreakpointState::Inserted);
    assert!(bp.is_claimed_by(EngineId(1)));
    drop(guard);
    assert!(first.sent().is_empty());
}

#[test]
fn test_slave_engine_leaves_views_to_master() {
    let mut slave = Harness::new();
    slave.engine.set_slave_engine(true);
    slave.walk_to_stop();
    slave.engine.request_continue().unwrap();
    slave.settle();
    slave.state_reply("running");
    slave.state_reply("stopped");
    assert_eq!(slave.engine.state(), SessionState::InferiorStopOk);

    let events = slave.events();
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::StateChanged { to: SessionState::InferiorStopOk, .. })));
    assert!(!events
        .iter()
        .any(|event| matches!(event, SessionEvent::ViewsUpdateRequested(_))));

    let mut master = Harness::stopped();
    master.engine.request_continue().unwrap();
    master.settle();
    master.state_reply("running");
    master.state_reply("stopped");
    assert!(master
        .events()
        .iter()
        .any(|event| matches!(event, SessionEvent::ViewsUpdateRequested(_))));
}
