//! Integration tests for the session registry against a local backend.

mod common;

use std::time::Duration;

use common::{harness, harness_with_window, login, pump_until, test_config, text, MockBackend, Step, UiEvent};
use termtab::lifecycle::ConnectionState;
use termtab::{ConnectOutcome, FatalKind, NoticeLevel, SessionError, TabId};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const TAB: TabId = TabId::FIRST;

fn query(url: &str, key: &str) -> Option<String> {
    reqwest::Url::parse(&format!("ws://host{url}"))
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

#[tokio::test]
async fn test_vm_ready_then_data_writes_exact_output() {
    let backend = MockBackend::start(vec![
        text(r#"{"type":"vm_creating"}"#),
        text(r#"{"type":"vm_ready"}"#),
        text(r#"{"type":"data","data":"hello"}"#),
    ])
    .await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    assert!(matches!(
        h.registry.connect(TAB, false),
        Ok(ConnectOutcome::Started { .. })
    ));
    let terminals = h.terminals.clone();
    assert!(pump_until(&mut h.registry, |_| terminals.output(TAB) == "hello").await);

    assert_eq!(h.terminals.output(TAB), "hello");
    assert_eq!(h.registry.state(TAB), Some(ConnectionState::Ready));
    assert!(h.ui.contains(&UiEvent::Loading(TAB, "Creating your environment...".into())));
    assert!(h.ui.contains(&UiEvent::TabAddEnabled(true)));
    assert!(h.ui.contains(&UiEvent::TabsVisible(true)));

    let record = h.terminals.latest(TAB).unwrap();
    assert_eq!(
        record.lock().unwrap().container.as_deref(),
        Some("terminal-container-1")
    );

    let received = backend.wait_for_received(1).await;
    assert_eq!(received[0], r#"{"type":"auth"}"#);
}

#[tokio::test]
async fn test_session_url_carries_token_and_tab() {
    let backend = MockBackend::start(vec![]).await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, true).unwrap();
    assert!(pump_until(&mut h.registry, |r| r.state(TAB) == Some(ConnectionState::AwaitingAuthAck)).await);

    let urls = backend.urls();
    assert_eq!(urls.len(), 1);
    assert_eq!(query(&urls[0], "token").as_deref(), Some("tok"));
    assert_eq!(query(&urls[0], "vmtype").as_deref(), Some("cka"));
    assert_eq!(query(&urls[0], "checksession").as_deref(), Some("true"));
    assert!(query(&urls[0], "terminalid").unwrap().starts_with("terminal_1_"));
}

#[tokio::test]
async fn test_non_control_payloads_pass_through() {
    let backend = MockBackend::start(vec![
        text(r#"{"type":"vm_ready"}"#),
        text("plain output "),
        text(r#"{"not":"typed"}"#),
        text(r#"{"type":"presence"}"#),
        Step::Send(Message::Binary(b" bin".to_vec())),
    ])
    .await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    let terminals = h.terminals.clone();
    assert!(pump_until(&mut h.registry, |_| terminals.output(TAB).ends_with(" bin")).await);

    assert_eq!(h.terminals.output(TAB), r#"plain output {"not":"typed"} bin"#);
}

#[tokio::test]
async fn test_input_is_sent_as_data_frames() {
    let backend = MockBackend::start(vec![text(r#"{"type":"vm_ready"}"#)]).await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    let terminals = h.terminals.clone();
    assert!(pump_until(&mut h.registry, |_| terminals.latest(TAB).is_some()).await);

    let record = h.terminals.latest(TAB).unwrap();
    let sink = record.lock().unwrap().sink.clone().unwrap();
    sink.send("ls\r");

    let received = backend.wait_for_received(3).await;
    assert!(received.contains(&r#"{"type":"data","data":"ls\r"}"#.to_string()));
}

#[tokio::test]
async fn test_resize_never_goes_below_defaults() {
    let backend = MockBackend::start(vec![text(r#"{"type":"vm_ready"}"#)]).await;
    let mut h = harness_with_window(test_config(backend.url()), 80, 24);
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    let terminals = h.terminals.clone();
    assert!(pump_until(&mut h.registry, |_| terminals.latest(TAB).is_some()).await);

    let received = backend.wait_for_received(2).await;
    let resize: serde_json::Value = serde_json::from_str(&received[1]).unwrap();
    assert_eq!(resize["type"], "resize");
    assert_eq!(resize["cols"], 120);
    assert_eq!(resize["rows"], 30);
}

#[tokio::test]
async fn test_resize_sends_fitted_size_above_defaults() {
    let backend = MockBackend::start(vec![text(r#"{"type":"vm_ready"}"#)]).await;
    let mut h = harness_with_window(test_config(backend.url()), 200, 50);
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    let terminals = h.terminals.clone();
    assert!(pump_until(&mut h.registry, |_| terminals.latest(TAB).is_some()).await);

    assert!(h.registry.resize_tab(TAB).unwrap());
    let received = backend.wait_for_received(3).await;
    for frame in &received[1..] {
        let resize: serde_json::Value = serde_json::from_str(frame).unwrap();
        assert_eq!((resize["cols"].as_u64(), resize["rows"].as_u64()), (Some(200), Some(50)));
    }
}

#[tokio::test]
async fn test_cooldown_with_session_expired_ends_everything() {
    let backend = MockBackend::start(vec![
        text(r#"{"type":"vm_ready"}"#),
        text(
            r#"{"type":"error","message":"Session expired","cooldown":{"expiryTimestamp":1735689600000,"formattedTime":"14:30"}}"#,
        ),
    ])
    .await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    assert!(pump_until(&mut h.registry, |r| r.cooldown().is_some()).await);
    assert!(pump_until(&mut h.registry, |r| r.socket_count() == 0).await);

    assert!(!h.registry.credentials().is_authenticated());
    assert!(!h.registry.has_terminal(TAB));
    assert!(h.terminals.latest(TAB).unwrap().lock().unwrap().disposed);
    assert!(h.ui.contains(&UiEvent::Cooldown(TAB, "14:30".into())));
    assert!(h.ui.contains(&UiEvent::TabsVisible(false)));
    assert!(h.ui.contains(&UiEvent::TabAddEnabled(false)));
    assert!(h.ui.contains(&UiEvent::Notify("Error: Session expired".into(), NoticeLevel::Error)));

    login(&mut h.registry);
    assert_eq!(
        h.registry.connect(TAB, false),
        Err(SessionError::ProtocolFatal(FatalKind::Cooldown))
    );
}

#[tokio::test]
async fn test_token_expired_invalidates_and_closes_after_grace() {
    let backend = MockBackend::start(vec![
        text(r#"{"type":"vm_ready"}"#),
        text(r#"{"type":"error","message":"Token expired"}"#),
    ])
    .await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    assert!(pump_until(&mut h.registry, |r| !r.credentials().is_authenticated()).await);
    assert!(h.registry.has_socket(TAB));

    assert!(pump_until(&mut h.registry, |r| r.socket_count() == 0).await);
    assert_eq!(h.registry.state(TAB), Some(ConnectionState::Failed));
    assert!(h.ui.contains(&UiEvent::AuthChanged(None)));
}

#[tokio::test]
async fn test_quota_exceeded_keeps_socket_and_credential() {
    let backend = MockBackend::start(vec![
        text(r#"{"type":"vm_ready"}"#),
        text(r#"{"type":"error","message":"You have reached the maximum limit of 1 terminal"}"#),
        text(r#"{"type":"data","data":"still here"}"#),
    ])
    .await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    let ui = std::sync::Arc::clone(&h.ui);
    assert!(pump_until(&mut h.registry, |_| ui.contains(&UiEvent::QuotaExceeded(TAB))).await);
    h.registry.run_for(Duration::from_millis(150)).await;

    assert!(h.registry.has_socket(TAB));
    assert!(h.registry.credentials().is_authenticated());
    assert_eq!(h.registry.state(TAB), Some(ConnectionState::Failed));
    // Output keeps flowing on the kept socket.
    assert_eq!(h.terminals.output(TAB), "still here");
}

#[tokio::test]
async fn test_environment_terminated_with_cooldown_keeps_credential() {
    let backend = MockBackend::start(vec![
        text(r#"{"type":"vm_ready"}"#),
        text(r#"{"type":"environment_terminated","cooldown":{"formattedTime":"10:15"}}"#),
    ])
    .await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    assert!(pump_until(&mut h.registry, |r| r.cooldown().is_some()).await);
    assert!(pump_until(&mut h.registry, |r| r.socket_count() == 0).await);

    assert!(h.registry.credentials().is_authenticated());
    assert!(h.ui.contains(&UiEvent::Cooldown(TAB, "10:15".into())));
    assert!(h.ui.contains(&UiEvent::TabAddEnabled(false)));
}

#[tokio::test]
async fn test_double_connect_opens_one_socket() {
    let backend = MockBackend::start(vec![]).await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    let first = h.registry.connect(TAB, false).unwrap();
    let second = h.registry.connect(TAB, false).unwrap();
    assert!(matches!(first, ConnectOutcome::Started { .. }));
    assert_eq!(second, ConnectOutcome::Skipped);

    h.registry.run_for(Duration::from_millis(200)).await;
    assert_eq!(backend.connections(), 1);
    assert_eq!(h.registry.socket_count(), 1);
}

#[tokio::test]
async fn test_reconnect_replaces_the_tab_socket() {
    let backend = MockBackend::start(vec![]).await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    assert!(pump_until(&mut h.registry, |r| r.state(TAB) == Some(ConnectionState::AwaitingAuthAck)).await);
    assert!(pump_until(&mut h.registry, |r| !r.latch().is_held()).await);

    assert!(matches!(
        h.registry.connect(TAB, false),
        Ok(ConnectOutcome::Started { .. })
    ));
    assert!(pump_until(&mut h.registry, |r| r.state(TAB) == Some(ConnectionState::AwaitingAuthAck)).await);

    assert_eq!(backend.connections(), 2);
    assert_eq!(h.registry.socket_count(), 1);
    for _ in 0..100 {
        if backend.closed() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(backend.closed(), 1);
    assert!(h.registry.credentials().is_authenticated());
}

#[tokio::test]
async fn test_missing_credential_opens_no_socket() {
    let backend = MockBackend::start(vec![]).await;
    let mut h = harness(test_config(backend.url()));

    assert_eq!(
        h.registry.connect(TAB, false),
        Err(SessionError::MissingCredential)
    );
    h.registry.run_for(Duration::from_millis(100)).await;

    assert_eq!(backend.connections(), 0);
    assert!(h.ui.notified("missing authentication token"));
}

#[tokio::test]
async fn test_cookie_without_profile_is_not_a_credential() {
    let backend = MockBackend::start(vec![]).await;
    let mut h = harness(test_config(backend.url()));
    h.registry
        .credentials_mut()
        .set_session_cookie(Some("tok".into()));

    assert_eq!(
        h.registry.connect(TAB, false),
        Err(SessionError::MissingCredential)
    );
    h.registry.run_for(Duration::from_millis(100)).await;

    assert_eq!(backend.connections(), 0);
    assert!(!h.registry.has_socket(TAB));
}

#[tokio::test]
async fn test_connection_timeout() {
    // Accepts TCP but never answers the WebSocket handshake.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    let _accepting = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let mut config = test_config(&url);
    config.connection_timeout_ms = 100;
    let mut h = harness(config);
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    assert!(pump_until(&mut h.registry, |r| r.state(TAB) == Some(ConnectionState::Failed)).await);

    assert!(h.ui.notified("Connection timeout. Server not responding."));
    assert!(!h.registry.has_socket(TAB));
    assert!(h.registry.credentials().is_authenticated());
    assert!(!h.ui.contains(&UiEvent::ConnectionLost(TAB)));
}

#[tokio::test]
async fn test_dropped_connection_shows_connection_lost() {
    let backend = MockBackend::start(vec![text(r#"{"type":"vm_ready"}"#), Step::Drop]).await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    assert!(pump_until(&mut h.registry, |r| !r.has_socket(TAB)).await);

    assert_eq!(h.registry.state(TAB), Some(ConnectionState::Failed));
    assert!(h.ui.contains(&UiEvent::ConnectionLost(TAB)));
    assert!(h.ui.contains(&UiEvent::TabsVisible(false)));
    assert!(!h.registry.credentials().is_authenticated());
}

#[tokio::test]
async fn test_clean_server_close_keeps_login() {
    let backend = MockBackend::start(vec![
        text(r#"{"type":"vm_ready"}"#),
        text(r#"{"type":"closed"}"#),
        Step::Send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))),
    ])
    .await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    assert!(pump_until(&mut h.registry, |r| !r.has_socket(TAB)).await);

    assert_eq!(h.registry.state(TAB), Some(ConnectionState::Closed));
    assert!(h.ui.notified("SSH connection closed"));
    assert!(!h.ui.contains(&UiEvent::ConnectionLost(TAB)));
    assert!(h.registry.credentials().is_authenticated());
    // The terminal stays so its last output remains readable.
    assert!(h.registry.has_terminal(TAB));
}

#[tokio::test]
async fn test_switch_reconnects_tab_after_clean_close() {
    let backend = MockBackend::start(vec![
        text(r#"{"type":"vm_ready"}"#),
        Step::Send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))),
    ])
    .await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    assert!(pump_until(&mut h.registry, |r| !r.has_socket(TAB)).await);
    assert!(pump_until(&mut h.registry, |r| !r.latch().is_held()).await);
    assert_eq!(h.registry.state(TAB), Some(ConnectionState::Closed));
    assert!(h.registry.has_terminal(TAB));
    let created = h.terminals.count();

    h.registry.switch_active_tab(TAB).unwrap();

    assert!(h.registry.has_socket(TAB));
    assert!(pump_until(&mut h.registry, |_| backend.connections() == 2).await);
    assert!(pump_until(&mut h.registry, |r| !r.has_socket(TAB)).await);
    // The old terminal is reused by the new socket.
    assert_eq!(h.terminals.count(), created);
}

#[tokio::test]
async fn test_switch_after_close_all_reconnects() {
    let backend = MockBackend::start(vec![text(r#"{"type":"vm_ready"}"#)]).await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    assert!(pump_until(&mut h.registry, |r| r.has_terminal(TAB)).await);
    h.registry.close_all();
    assert!(pump_until(&mut h.registry, |r| !r.latch().is_held()).await);

    h.registry.switch_active_tab(TAB).unwrap();

    assert!(h.registry.has_socket(TAB));
    assert!(pump_until(&mut h.registry, |r| r.state(TAB) == Some(ConnectionState::Ready)).await);
    assert_eq!(backend.connections(), 2);
}

#[tokio::test]
async fn test_tabs_each_hold_one_socket() {
    let backend = MockBackend::start(vec![text(r#"{"type":"vm_ready"}"#)]).await;
    let mut h = harness(test_config(backend.url()));
    login(&mut h.registry);

    h.registry.connect(TAB, false).unwrap();
    assert!(pump_until(&mut h.registry, |r| r.has_terminal(TAB)).await);
    assert!(pump_until(&mut h.registry, |r| !r.latch().is_held()).await);

    let second = h.registry.create_tab().unwrap();
    assert_eq!(second.get(), 2);
    assert_eq!(h.registry.active_tab(), second);
    assert!(pump_until(&mut h.registry, |r| r.has_terminal(second)).await);

    assert_eq!(h.registry.socket_count(), 2);
    assert_eq!(backend.connections(), 2);

    // Switching back reuses the existing terminal.
    let created = h.terminals.count();
    h.registry.switch_active_tab(TAB).unwrap();
    assert_eq!(h.registry.active_tab(), TAB);
    assert_eq!(h.terminals.count(), created);
    assert_eq!(h.registry.socket_count(), 2);

    h.registry.close_all();
    assert_eq!(h.registry.socket_count(), 0);
    assert!(h.registry.has_terminal(TAB));
}
