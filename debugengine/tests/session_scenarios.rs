/// Event loop scenarios against a scripted bridge task

use debugengine::process::BackendEvent;
use debugengine::*;
use std::time::Duration;
use tokio::sync::mpsc;

/// Answers lifecycle commands the way the bridge does and records every
/// command it sees.
async fn scripted_bridge(
    mut commands: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<BackendEvent>,
) -> Vec<String> {
    let mut seen = Vec::new();
    while let Some(line) = commands.recv().await {
        let command: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        let name = command["cmd"].as_str().unwrap_or_default().to_string();
        let token = command["token"].as_u64().unwrap();
        let reply = match name.as_str() {
            "setupEngine" => format!("{{\"state\":\"enginesetupok\",\"token\":{}}}@\n", token),
            "setupInferior" => format!("{{\"state\":\"inferiorsetupok\",\"token\":{}}}@\n", token),
            "runEngine" => format!("{{\"state\":\"enginerunandinferiorstopok\",\"token\":{}}}@\n", token),
            "executeStep" => format!(
                "{{\"state\":\"running\",\"token\":{}}}@\nstate=\"stopped\"@\n",
                token
            ),
            "shutdownInferior" => format!("{{\"state\":\"inferiorshutdownok\",\"token\":{}}}@\n", token),
            _ => String::new(),
        };
        seen.push(name);
        if !reply.is_empty() {
            // Deliver in two chunks to exercise block reassembly.
            let bytes = reply.into_bytes();
            let (head, tail) = bytes.split_at(bytes.len() / 2);
            events.send(BackendEvent::Output(head.to_vec())).unwrap();
            events.send(BackendEvent::Output(tail.to_vec())).unwrap();
        }
    }
    let _ = events.send(BackendEvent::Exited(Some(0)));
    seen
}

#[tokio::test]
async fn test_full_session_through_event_loop() {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (backend_tx, mut backend_rx) = mpsc::unbounded_channel();
    let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();

    let mut engine = DebuggerEngine::new(
        EngineId(1),
        Box::new(BridgeBackend::new()),
        outbound_tx,
        SessionConfig::default(),
        BreakHandler::shared(),
    );
    let mut events = engine.subscribe();
    let bridge = tokio::spawn(scripted_bridge(outbound_rx, backend_tx));

    // Step once at the first stop, shut down at the second.
    let client = tokio::spawn(async move {
        let mut stops = 0;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged {
                    to: SessionState::InferiorStopOk,
                    ..
                } => {
                    stops += 1;
                    let request = if stops == 1 {
                        SessionRequest::Step
                    } else {
                        SessionRequest::Shutdown
                    };
                    if requests_tx.send(request).is_err() {
                        break;
                    }
                }
                SessionEvent::Finished => break,
                _ => {}
            }
        }
        stops
    });

    engine.start_setup(SessionParameters::launch("/bin/app")).unwrap();
    let state = tokio::time::timeout(
        Duration::from_secs(10),
        run_event_loop(&mut engine, &mut backend_rx, &mut requests_rx),
    )
    .await
    .unwrap();
    assert_eq!(state, SessionState::Finished);
    assert_eq!(engine.unexpected_transitions(), 0);

    drop(engine);
    let seen = bridge.await.unwrap();
    assert_eq!(
        &seen[..4],
        &["setupEngine", "setupInferior", "runEngine", "executeStep"]
    );
    assert!(seen.contains(&"reportStack".to_string()));
    assert_eq!(&seen[seen.len() - 2..], &["shutdownInferior", "shutdownEngine"]);
    assert_eq!(client.await.unwrap(), 2);
}

#[tokio::test]
async fn test_closed_request_channel_shuts_down() {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (backend_tx, mut backend_rx) = mpsc::unbounded_channel();
    let (requests_tx, mut requests_rx) = mpsc::unbounded_channel::<SessionRequest>();

    let mut engine = DebuggerEngine::new(
        EngineId(1),
        Box::new(BridgeBackend::new()),
        outbound_tx,
        SessionConfig::default(),
        BreakHandler::shared(),
    );
    let mut events = engine.subscribe();
    let bridge = tokio::spawn(scripted_bridge(outbound_rx, backend_tx));

    // The client goes away as soon as the inferior is stopped.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let SessionEvent::StateChanged {
                to: SessionState::InferiorStopOk,
                ..
            } = event
            {
                break;
            }
        }
        drop(requests_tx);
    });

    engine.start_setup(SessionParameters::launch("/bin/app")).unwrap();
    let state = tokio::time::timeout(
        Duration::from_secs(10),
        run_event_loop(&mut engine, &mut backend_rx, &mut requests_rx),
    )
    .await
    .unwrap();

    assert_eq!(state, SessionState::Finished);
    assert_eq!(engine.unexpected_transitions(), 0);
    drop(engine);
    let seen = bridge.await.unwrap();
    assert_eq!(seen.last().map(String::as_str), Some("shutdownEngine"));
}
