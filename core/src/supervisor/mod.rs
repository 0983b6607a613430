//! Lifecycle supervision for the service under test.
//!
//! The supervisor owns the child process: it spawns the configured shell
//! command in its own process group, streams its output into the log bus,
//! polls the readiness probe, health-checks between tests, and tears the
//! whole group down with a grace period. Teardown is best-effort: a stop
//! that fails is logged, never propagated.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::process::Command;
use tokio::time::Instant;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ServiceConfig;
use crate::error::DriftError;
use crate::error::Result;
use crate::events::LogBus;
use crate::events::RunEvent;

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const RESTART_BASE_DELAY: Duration = Duration::from_millis(500);
const RESTART_MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Starting,
    Ready,
    Running,
    Stopping,
    Crashed,
}

pub struct ServiceSupervisor {
    config: ServiceConfig,
    bus: LogBus,
    state: Mutex<SupervisorState>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl ServiceSupervisor {
    pub fn new(config: ServiceConfig, bus: LogBus) -> Self {
        Self {
            config,
            bus,
            state: Mutex::new(SupervisorState::Idle),
            child: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(SupervisorState::Idle)
    }

    fn set_state(&self, next: SupervisorState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                debug!(from = ?*state, to = ?next, "service state change");
                *state = next;
                self.bus.publish(RunEvent::ServiceStateChanged(next));
            }
        }
    }

    /// Marks the transition from readiness into test traffic.
    pub fn mark_running(&self) {
        self.set_state(SupervisorState::Running);
    }

    /// Spawns the configured start command with `extra_env` injected. The
    /// child gets its own process group so that stop can signal the whole
    /// tree.
    pub async fn start(&self, extra_env: &[(String, String)]) -> Result<()> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Err(DriftError::Startup(
                "service is already running".to_string(),
            ));
        }
        self.set_state(SupervisorState::Starting);

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.config.start_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        for (key, value) in extra_env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            self.set_state(SupervisorState::Idle);
            DriftError::Startup(format!(
                "failed to spawn start command {:?}: {err}",
                self.config.start_command
            ))
        })?;
        info!(command = %self.config.start_command, pid = child.id(), "service starting");

        if let Some(stdout) = child.stdout.take() {
            let bus = self.bus.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    bus.publish(RunEvent::ServiceStdout(line));
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let bus = self.bus.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    bus.publish(RunEvent::ServiceStderr(line));
                }
            });
        }

        *guard = Some(child);
        Ok(())
    }

    /// Polls the readiness probe until it succeeds or the configured
    /// timeout elapses. On timeout the service is stopped and a diagnostic
    /// enumerating the likely causes is returned.
    pub async fn await_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.readiness.timeout;
        loop {
            if let Some(status) = self.try_wait().await {
                let diagnostic = self.startup_diagnostic(&format!(
                    "the start command exited immediately ({status})"
                ));
                self.stop().await;
                return Err(DriftError::Startup(diagnostic));
            }
            if self.probe_ready().await {
                self.set_state(SupervisorState::Ready);
                info!("service ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                let diagnostic = self.startup_diagnostic(&format!(
                    "the service did not become ready within {:?}",
                    self.config.readiness.timeout
                ));
                self.stop().await;
                return Err(DriftError::Startup(diagnostic));
            }
            sleep(self.config.readiness.interval).await;
        }
    }

    fn startup_diagnostic(&self, cause: &str) -> String {
        format!(
            "{cause}. Check that: the start command ({:?}) runs from this directory, \
             port {} is not already in use, and the readiness probe ({}) can succeed.",
            self.config.start_command,
            self.config.port,
            match &self.config.readiness.command {
                Some(command) => format!("command {command:?}"),
                None => format!(
                    "connect to port {}",
                    self.config.readiness.port.unwrap_or(self.config.port)
                ),
            }
        )
    }

    async fn probe_ready(&self) -> bool {
        match &self.config.readiness.command {
            Some(command) => {
                let status = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                matches!(status, Ok(status) if status.success())
            }
            None => {
                let port = self.config.readiness.port.unwrap_or(self.config.port);
                connect_probe(port).await
            }
        }
    }

    async fn try_wait(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        child.try_wait().ok().flatten()
    }

    /// Lightweight post-test probe. A failure flips the supervisor into the
    /// crashed state.
    pub async fn health_check(&self) -> bool {
        if self.try_wait().await.is_some() {
            warn!("service process exited");
            self.set_state(SupervisorState::Crashed);
            return false;
        }
        if connect_probe(self.config.port).await {
            true
        } else {
            warn!(port = self.config.port, "service health probe failed");
            self.set_state(SupervisorState::Crashed);
            false
        }
    }

    /// Terminates the process group: SIGTERM, a grace period, then SIGKILL.
    /// Always lands back in the idle state.
    pub async fn stop(&self) {
        self.set_state(SupervisorState::Stopping);
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            signal_group(&child, libc::SIGTERM);
            match timeout(self.config.stop_grace_period, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "service exited"),
                Ok(Err(err)) => warn!(?err, "failed waiting for service exit"),
                Err(_) => {
                    warn!(
                        grace = ?self.config.stop_grace_period,
                        "service ignored SIGTERM, killing process group"
                    );
                    signal_group(&child, libc::SIGKILL);
                    if let Err(err) = child.wait().await {
                        warn!(?err, "failed reaping killed service");
                    }
                }
            }
        }
        self.set_state(SupervisorState::Idle);
    }

    /// Stop/start/await-ready with exponential backoff. Gives up after
    /// `retries` failed attempts; persistent failure is fatal for the
    /// current environment group.
    pub async fn restart(&self, retries: u32, extra_env: &[(String, String)]) -> Result<()> {
        let mut last_error = None;
        for attempt in 0..retries.max(1) {
            self.stop().await;
            let result = async {
                self.start(extra_env).await?;
                self.await_ready().await
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let delay = RESTART_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(RESTART_MAX_DELAY);
                    warn!(attempt, ?delay, %err, "service restart attempt failed");
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            DriftError::Startup("service restart failed".to_string())
        }))
    }
}

fn signal_group(child: &Child, signal: i32) {
    let Some(pid) = child.id() else {
        return;
    };
    // The child leads its own process group, so signal the group id.
    #[cfg(unix)]
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
    #[cfg(not(unix))]
    let _ = (pid, signal);
}

async fn connect_probe(port: u16) -> bool {
    matches!(
        timeout(CONNECT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests;
