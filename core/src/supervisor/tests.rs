#![cfg(unix)]

use std::time::Duration;

use tokio::net::TcpListener;

use super::ServiceSupervisor;
use super::SupervisorState;
use crate::config::ReadinessConfig;
use crate::config::ServiceConfig;
use crate::events::LogBus;
use crate::events::RunEvent;

fn config(start_command: &str, readiness_command: Option<&str>) -> ServiceConfig {
    ServiceConfig {
        start_command: start_command.to_string(),
        port: 1,
        readiness: ReadinessConfig {
            command: readiness_command.map(|command| command.to_string()),
            port: None,
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(600),
        },
        stop_grace_period: Duration::from_millis(500),
    }
}

#[tokio::test]
async fn start_ready_stop_walks_the_state_machine() {
    let supervisor = ServiceSupervisor::new(config("sleep 5", Some("true")), LogBus::new());
    assert_eq!(supervisor.state(), SupervisorState::Idle);

    supervisor.start(&[]).await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Starting);

    supervisor.await_ready().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Ready);

    supervisor.mark_running();
    assert_eq!(supervisor.state(), SupervisorState::Running);

    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn readiness_timeout_stops_the_service_and_diagnoses() {
    let supervisor = ServiceSupervisor::new(config("sleep 5", Some("false")), LogBus::new());
    supervisor.start(&[]).await.unwrap();
    let err = supervisor.await_ready().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("did not become ready"), "{message}");
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn immediate_exit_is_reported_as_such() {
    let supervisor = ServiceSupervisor::new(config("true", Some("false")), LogBus::new());
    supervisor.start(&[]).await.unwrap();
    // Give the process a moment to exit before the first poll.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = supervisor.await_ready().await.unwrap_err();
    assert!(err.to_string().contains("exited immediately"), "{err}");
}

#[tokio::test]
async fn double_start_is_rejected() {
    let supervisor = ServiceSupervisor::new(config("sleep 5", Some("true")), LogBus::new());
    supervisor.start(&[]).await.unwrap();
    assert!(supervisor.start(&[]).await.is_err());
    supervisor.stop().await;
}

#[tokio::test]
async fn extra_env_reaches_the_service_process() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("env.txt");
    let command = format!("printf '%s' \"$REPLAY_TEST_VALUE\" > {} && sleep 5", out.display());
    let supervisor = ServiceSupervisor::new(config(&command, Some("true")), LogBus::new());
    supervisor
        .start(&[("REPLAY_TEST_VALUE".to_string(), "forty-two".to_string())])
        .await
        .unwrap();
    supervisor.await_ready().await.unwrap();

    // The file is written on startup; poll briefly for it.
    let mut contents = String::new();
    for _ in 0..50 {
        if let Ok(read) = std::fs::read_to_string(&out) {
            contents = read;
            if !contents.is_empty() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(contents, "forty-two");
    supervisor.stop().await;
}

#[tokio::test]
async fn stdout_lines_reach_the_log_bus() {
    let bus = LogBus::new();
    let mut events = bus.subscribe();
    let supervisor =
        ServiceSupervisor::new(config("echo hello-from-service && sleep 5", Some("true")), bus);
    supervisor.start(&[]).await.unwrap();

    let line = loop {
        match events.recv().await.unwrap() {
            RunEvent::ServiceStdout(line) => break line,
            _ => continue,
        }
    };
    assert_eq!(line, "hello-from-service");
    supervisor.stop().await;
}

#[tokio::test]
async fn health_check_passes_while_the_port_listens() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut service = config("sleep 5", Some("true"));
    service.port = port;
    let supervisor = ServiceSupervisor::new(service, LogBus::new());
    supervisor.start(&[]).await.unwrap();
    supervisor.await_ready().await.unwrap();

    assert!(supervisor.health_check().await);
    assert_eq!(supervisor.state(), SupervisorState::Ready);

    drop(listener);
    assert!(!supervisor.health_check().await);
    assert_eq!(supervisor.state(), SupervisorState::Crashed);

    supervisor.stop().await;
}

#[tokio::test]
async fn restart_recovers_after_a_crash() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut service = config("sleep 5", Some("true"));
    service.port = port;
    let supervisor = ServiceSupervisor::new(service, LogBus::new());
    supervisor.start(&[]).await.unwrap();
    supervisor.await_ready().await.unwrap();

    supervisor.stop().await;
    supervisor.restart(2, &[]).await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Ready);
    supervisor.stop().await;
}

#[tokio::test]
async fn stop_kills_children_that_ignore_nothing() {
    // A shell that spawns its own child exercises the process-group kill.
    let supervisor =
        ServiceSupervisor::new(config("sh -c 'sleep 30' & sleep 30", Some("true")), LogBus::new());
    supervisor.start(&[]).await.unwrap();
    supervisor.await_ready().await.unwrap();

    let started = std::time::Instant::now();
    supervisor.stop().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}
