#![allow(clippy::unwrap_used)]

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;

use termbridge::event::AppEvent;
use termbridge::protocol::parse::parse_line;
use termbridge::relay::extractor::{ExtractorState, finish, process};
use termbridge::relay::scheduler::{FlushScheduler, ManualFrames, SteppingClock};
use termbridge::relay::stream::TerminalStream;
use termbridge::session::bridge::SessionConfig;
use termbridge::session::driver::SessionDriver;
use termbridge::session::history::load_history;
use termbridge::session::pending::PermissionDecision;
use termbridge::session::registry::SessionRegistry;
use termbridge::session::state::SessionStatus;

// --- relay ---

#[test]
fn clipboard_sequence_split_across_reads() {
    let mut state = ExtractorState::new();
    let mut visible = Vec::new();
    let mut events = Vec::new();
    for chunk in [&b"ls\r\n\x1b]5"[..], b"2;c;aGVs", b"bG8=\x1b", b"\\prompt$ "] {
        let out = process(chunk, &mut state);
        visible.extend(out.visible);
        events.extend(out.events);
    }
    visible.extend(finish(&mut state).visible);

    assert_eq!(visible, b"ls\r\nprompt$ ");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].text, "hello");
}

#[test]
fn stream_paces_output_and_closes_cleanly() {
    let mut stream = TerminalStream::new(FlushScheduler::with_clock(
        Vec::new(),
        ManualFrames::default(),
        SteppingClock::new(Duration::from_millis(2)),
        Duration::from_millis(4),
    ));
    for i in 0..5u8 {
        stream.push(&[b'a' + i]);
    }
    let handle = stream.scheduler_mut().frames_mut().take_due().unwrap();
    stream.on_frame(handle);
    assert!(stream.scheduler().pending() > 0);
    assert!(stream.scheduler().is_scheduled());

    stream.close();
    assert!(stream.is_closed());
    assert_eq!(stream.scheduler().pending(), 0);
    assert!(!stream.scheduler().is_scheduled());
    let written: Vec<u8> = stream.scheduler().sink().concat();
    assert!(b"abcde".starts_with(&written));
}

// --- session bridge driven by agent output ---

fn agent(line: &str) -> AppEvent {
    AppEvent::Agent(Box::new(parse_line(line).unwrap().unwrap()))
}

#[tokio::test]
async fn agent_session_round_trip_and_resume() {
    let dir = TempDir::new().unwrap();
    let registry = SessionRegistry::new(Some(dir.path().to_path_buf()));
    let config = SessionConfig {
        cwd: Some(PathBuf::from("/work")),
        model: Some("sonnet".into()),
        ..SessionConfig::default()
    };
    let (session_id, bridge) = registry.create_session(config.clone()).await.unwrap();

    let (tx, mut agent_stdin) = mpsc::unbounded_channel();
    let driver = SessionDriver::new(bridge.clone(), tx).with_known_sessions(registry.known_sessions());
    for line in [
        r#"{"type":"system","subtype":"init","session_id":"cli-42","model":"sonnet"}"#,
        r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"tool_use","id":"tu_1","name":"Bash","input":{"command":"make"}}]}}"#,
        r#"{"type":"control_request","request_id":"req-1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"make"}}}"#,
    ] {
        driver.handle(agent(line)).await;
    }
    assert_eq!(bridge.lock().await.status(), SessionStatus::AwaitingInput);

    registry
        .resolve_permission(
            &session_id,
            "req-1",
            PermissionDecision::Deny {
                message: Some("not now".into()),
            },
        )
        .await
        .unwrap();
    let response: Value = serde_json::from_str(&agent_stdin.recv().await.unwrap()).unwrap();
    assert_eq!(response["type"], "control_response");
    assert_eq!(response["response"]["response"]["behavior"], "deny");
    assert_eq!(response["response"]["response"]["message"], "not now");

    for line in [
        r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"tu_1","content":"denied","is_error":true}]}}"#,
        r#"{"type":"result","subtype":"success","total_cost_usd":0.01,"num_turns":1}"#,
    ] {
        driver.handle(agent(line)).await;
    }
    driver.handle(AppEvent::ProcessExit(Some(0))).await;
    assert_eq!(bridge.lock().await.status(), SessionStatus::Completed);
    registry.remove(&session_id).await.unwrap();

    let path = dir.path().join(format!("{session_id}.jsonl"));
    let restored = load_history(&path).unwrap();
    assert!(!restored.report.is_corrupted());

    let (_, resumed) = registry
        .create_session(SessionConfig {
            resume_session_id: Some("cli-42".into()),
            ..config
        })
        .await
        .unwrap();
    let resumed = resumed.lock().await;
    assert_eq!(resumed.cli_session_id(), Some("cli-42"));
    assert_eq!(resumed.messages().len(), 2);
}

#[tokio::test]
async fn unknown_resume_target_is_rejected() {
    let registry = SessionRegistry::new(None);
    let err = registry
        .create_session(SessionConfig {
            cwd: Some(PathBuf::from("/work")),
            model: Some("sonnet".into()),
            resume_session_id: Some("never-seen".into()),
            history_path: None,
        })
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("never-seen"));
}
