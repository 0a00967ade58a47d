//! Integration tests for Animatron
//!
//! These tests drive the assembled assistant, both in-process and over the
//! control socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use animatron::config::Config;
use animatron::events::{Event, topics};
use animatron::ipc::{AssistantClient, IpcServer, create_listener_at};
use animatron::mode::{Mode, ModeSetup, SetupError, TransitionRejected, TransitionStatus};
use animatron::runtime::Assistant;

/// Setup that waits `delay` and then succeeds
struct SlowSetup {
    delay: Duration,
}

#[async_trait]
impl ModeSetup for SlowSetup {
    async fn prepare(&self, _from: Mode, _to: Mode) -> Result<(), SetupError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Setup whose collaborator never answers
struct HangingSetup;

#[async_trait]
impl ModeSetup for HangingSetup {
    async fn prepare(&self, _from: Mode, _to: Mode) -> Result<(), SetupError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn topics_of(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.topic.as_str()).collect()
}

// =============================================================================
// In-process scenarios
// =============================================================================

#[tokio::test]
async fn test_volume_command_is_replayable() {
    let assistant = Assistant::new(Config::default(), None).expect("Failed to build assistant");

    let seq = assistant
        .submit(&json!({"type": "music", "action": "volume", "volume_level": 0.8}))
        .await
        .expect("volume command should validate");

    let events = assistant.bus().snapshot(Some(seq - 1)).expect("No gap expected");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sequence_id, seq);
    assert_eq!(events[0].topic, topics::MUSIC_COMMAND);
    assert_eq!(
        serde_json::Value::Object(events[0].payload.clone()),
        json!({"action": "volume", "volume": 0.8, "source": "dashboard"})
    );
}

#[tokio::test]
async fn test_invalid_command_publishes_nothing() {
    let assistant = Assistant::new(Config::default(), None).expect("Failed to build assistant");

    let err = assistant
        .submit(&json!({"type": "music", "action": "volume", "volume_level": 3}))
        .await
        .unwrap_err();
    assert_eq!(err.errors.len(), 1);
    assert_eq!(err.errors[0].field, "volume_level");
    assert_eq!(assistant.bus().last_sequence_id(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transition_timeout_leaves_mode_unchanged() {
    let assistant =
        Assistant::with_setup(Config::default(), Arc::new(HangingSetup)).expect("Failed to build assistant");

    let transition = assistant
        .mode_machine()
        .request_transition(Mode::Interactive)
        .await
        .expect("Transition should be accepted");
    assert_eq!(transition.status, TransitionStatus::Failed);
    assert_eq!(transition.error.as_deref(), Some("timeout"));
    assert_eq!(assistant.mode_machine().current_mode(), Mode::Idle);
    assert!(assistant.mode_machine().in_flight().is_none());

    let events = assistant.bus().snapshot(None).expect("No gap expected");
    assert_eq!(topics_of(&events), vec![topics::MODE_TRANSITION, topics::MODE_TRANSITION]);
    assert_eq!(events[0].str_field("status"), Some("started"));
    assert_eq!(events[1].str_field("status"), Some("failed"));
    assert_eq!(events[1].str_field("error"), Some("timeout"));
    assert_eq!(events[0].str_field("transition_id"), events[1].str_field("transition_id"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_transition_is_rejected() {
    let setup = Arc::new(SlowSetup {
        delay: Duration::from_millis(500),
    });
    let assistant = Assistant::with_setup(Config::default(), setup).expect("Failed to build assistant");
    let machine = assistant.mode_machine();

    let (first, second) = tokio::join!(
        machine.request_transition(Mode::Ambient),
        machine.request_transition(Mode::Interactive),
    );

    let first = first.expect("First request should be accepted");
    assert_eq!(first.status, TransitionStatus::Completed);
    assert_eq!(
        second.unwrap_err(),
        TransitionRejected::InProgress {
            from: Mode::Idle,
            to: Mode::Ambient
        }
    );
    assert_eq!(machine.current_mode(), Mode::Ambient);

    let events = assistant.bus().snapshot(None).expect("No gap expected");
    assert_eq!(
        topics_of(&events),
        vec![topics::MODE_TRANSITION, topics::MODE_TRANSITION, topics::SYSTEM_MODE_CHANGE]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_set_mode_commands_reject_the_second() {
    let setup = Arc::new(SlowSetup {
        delay: Duration::from_millis(300),
    });
    let assistant = Assistant::with_setup(Config::default(), setup).expect("Failed to build assistant");
    let mut live = assistant.bus().watch();

    let ambient_event = json!({"type": "system", "action": "set_mode", "mode": "ambient"});
    let interactive_event = json!({"type": "system", "action": "set_mode", "mode": "interactive"});
    let (first, second) = tokio::join!(
        assistant.submit(&ambient_event),
        assistant.submit(&interactive_event),
    );
    first.expect("set_mode should validate");
    second.expect("set_mode should validate");

    // Both replies arrive before the first transition's setup has finished
    assert!(assistant.mode_machine().in_flight().is_some());

    tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(event) = live.recv().await {
            if event.topic == topics::SYSTEM_MODE_CHANGE {
                break;
            }
        }
    })
    .await
    .expect("Transition did not finish");

    let events = assistant.bus().snapshot(None).expect("No gap expected");
    let rejections: Vec<&Event> = events.iter().filter(|e| e.topic == topics::LOG_EVENT).collect();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].str_field("code"), Some("transition_in_progress"));
    assert_eq!(rejections[0].str_field("requested_mode"), Some("interactive"));

    let transitions: Vec<String> = events
        .iter()
        .filter(|e| e.topic == topics::MODE_TRANSITION)
        .map(|e| {
            format!(
                "{}->{}:{}",
                e.str_field("from_mode").unwrap_or_default(),
                e.str_field("to_mode").unwrap_or_default(),
                e.str_field("status").unwrap_or_default()
            )
        })
        .collect();
    assert_eq!(transitions, vec!["idle->ambient:started", "idle->ambient:completed"]);
    assert_eq!(assistant.mode_machine().current_mode(), Mode::Ambient);
}

#[tokio::test]
async fn test_set_mode_command_drives_collaborators() {
    let assistant = Assistant::new(Config::default(), None).expect("Failed to build assistant");
    let mut live = assistant.bus().watch();

    assistant
        .submit(&json!({"type": "system", "action": "set_mode", "mode": "interactive"}))
        .await
        .expect("set_mode should validate");
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(event) = live.recv().await {
            if event.topic == topics::SYSTEM_MODE_CHANGE {
                break;
            }
        }
    })
    .await
    .expect("Transition did not finish");
    while assistant.mode_machine().in_flight().is_some() {
        tokio::task::yield_now().await;
    }
    assert_eq!(assistant.status().current_mode, Mode::Interactive);

    let events = assistant.bus().snapshot(None).expect("No gap expected");
    let seen = topics_of(&events);
    assert_eq!(seen[0], topics::SYSTEM_COMMAND);
    assert!(seen.contains(&topics::LED_COMMAND));
    assert!(seen.contains(&topics::VOICE_COMMAND));
    assert_eq!(seen.last().copied(), Some(topics::SYSTEM_MODE_CHANGE));

    let voice = events
        .iter()
        .find(|e| e.topic == topics::VOICE_COMMAND)
        .expect("voice command should be published");
    assert_eq!(voice.str_field("action"), Some("start"));

    // Same mode again is rejected and reported on the log topic
    let before = assistant.bus().last_sequence_id();
    assistant
        .submit(&json!({"type": "system", "action": "set_mode", "mode": "interactive"}))
        .await
        .expect("set_mode should validate");
    let events = assistant.bus().snapshot(Some(before)).expect("No gap expected");
    assert_eq!(topics_of(&events), vec![topics::SYSTEM_COMMAND, topics::LOG_EVENT]);
    assert_eq!(events[1].str_field("code"), Some("already_in_mode"));
}

#[tokio::test]
async fn test_restart_updates_health() {
    let assistant = Assistant::new(Config::default(), None).expect("Failed to build assistant");

    assistant
        .submit(&json!({"type": "system", "action": "restart", "service": "music"}))
        .await
        .expect("restart should validate");

    let status = assistant.status();
    assert_eq!(status.services["music"].state, "restarting");
    assert!(status.healthy);

    let events = assistant.bus().snapshot(None).expect("No gap expected");
    let system_status = events
        .iter()
        .find(|e| e.topic == topics::SYSTEM_STATUS)
        .expect("system status should be published");
    assert_eq!(system_status.payload["healthy"], json!(true));
    assert_eq!(system_status.payload["current_mode"], json!("idle"));
}

#[tokio::test]
async fn test_replay_buffer_reports_gap() {
    let mut config = Config::default();
    config.bus.replay_capacity = 3;
    let assistant = Assistant::new(config, None).expect("Failed to build assistant");

    for level in [0.1, 0.2, 0.3, 0.4, 0.5] {
        assistant
            .submit(&json!({"type": "music", "action": "volume", "volume_level": level}))
            .await
            .expect("volume command should validate");
    }

    let gap = assistant.bus().snapshot(Some(1)).unwrap_err();
    assert_eq!(gap.oldest, Some(3));
    let events = assistant.bus().snapshot(Some(2)).expect("Cursor 2 is still covered");
    assert_eq!(events.iter().map(|e| e.sequence_id).collect::<Vec<_>>(), vec![3, 4, 5]);
}

// =============================================================================
// Control socket
// =============================================================================

struct Running {
    _temp_dir: TempDir,
    assistant: Arc<Assistant>,
    server: Arc<IpcServer>,
    client: AssistantClient,
    handle: tokio::task::JoinHandle<()>,
}

async fn start_server() -> Running {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let socket_path = temp_dir.path().join("animatron.sock");
    let (listener, socket_path) = create_listener_at(&socket_path).expect("Failed to bind socket");

    let assistant = Arc::new(Assistant::new(Config::default(), None).expect("Failed to build assistant"));
    let server = Arc::new(IpcServer::new(assistant.clone()));
    let handle = {
        let server = server.clone();
        tokio::spawn(async move {
            server.serve(listener).await.expect("Server failed");
        })
    };

    Running {
        _temp_dir: temp_dir,
        assistant,
        server,
        client: AssistantClient::with_socket_path(socket_path),
        handle,
    }
}

#[tokio::test]
async fn test_socket_command_and_snapshot() {
    let running = start_server().await;

    let version = running.client.ping().await.expect("Ping failed");
    assert_eq!(version, env!("CARGO_PKG_VERSION"));

    let seq = running
        .client
        .send_command(json!({"type": "music", "action": "volume", "volume_level": 0.8}))
        .await
        .expect("Command failed");
    assert_eq!(seq, 1);

    let events = running.client.snapshot(Some(seq - 1)).await.expect("Snapshot failed");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["volume"], json!(0.8));

    running.server.shutdown();
    let _ = running.handle.await;
}

#[tokio::test]
async fn test_socket_validation_error_lists_fields() {
    let running = start_server().await;

    let response = running
        .client
        .request(animatron::ipc::Request::Command {
            command: json!({"type": "dj", "action": "update_settings", "transition_duration": 0.5}),
        })
        .await
        .expect("Request failed");
    assert!(!response.is_ok());
    match response {
        animatron::ipc::Response::Error { code, errors, .. } => {
            assert_eq!(code.as_deref(), Some("validation"));
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].field, "transition_duration");
        }
        other => panic!("unexpected response: {:?}", other),
    }
    assert_eq!(running.assistant.bus().last_sequence_id(), 0);

    running.server.shutdown();
    let _ = running.handle.await;
}

#[tokio::test]
async fn test_socket_follow_streams_backlog_then_live() {
    let running = start_server().await;

    running
        .client
        .send_command(json!({"type": "dj", "action": "start"}))
        .await
        .expect("Command failed");
    let cursor = running.assistant.bus().last_sequence_id();

    let mut follower = running.client.follow(Some(0)).await.expect("Follow failed");
    assert_eq!(follower.backlog.len() as u64, cursor);
    assert_eq!(follower.cursor, cursor);

    running
        .client
        .send_command(json!({"type": "music", "action": "pause"}))
        .await
        .expect("Command failed");

    let event = tokio::time::timeout(Duration::from_secs(5), follower.next_event())
        .await
        .expect("Timed out waiting for live event")
        .expect("Stream error")
        .expect("Stream closed early");
    assert_eq!(event.sequence_id, cursor + 1);
    assert_eq!(event.topic, topics::MUSIC_COMMAND);

    running.assistant.shutdown().await;
    running.server.shutdown();
    let _ = running.handle.await;
}

#[tokio::test]
async fn test_socket_status_and_shutdown() {
    let running = start_server().await;
    let mut shutdown = running.server.shutdown_signal();

    let status = running.client.status().await.expect("Status failed");
    assert_eq!(status["current_mode"], json!("idle"));
    assert_eq!(status["dj"]["active"], json!(false));

    running.client.shutdown().await.expect("Shutdown request failed");
    tokio::time::timeout(Duration::from_secs(5), shutdown.wait_for(|stop| *stop))
        .await
        .expect("Shutdown was not signalled")
        .expect("Signal sender dropped");

    tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("Server did not stop")
        .expect("Server task panicked");
}
