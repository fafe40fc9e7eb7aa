//! Scripted stand-ins for the OS, shared by the unit tests of this crate

use crate::config::{Endpoint, LaunchSpec};
use crate::error::{LaunchError, ProbeError};
use crate::output::OutputLines;
use crate::probe::PortProbe;
use crate::process::{
    ExitReason, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager, ProcessTermination,
    TerminationResult,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) const TERM_SIGNAL: i32 = 15;

pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Process that reports alive from the `alive_from`th liveness check and
/// exits once it has been asked for its status `exit_at` times.
///
/// Like a real child handle it stops reporting a PID once an exit status has
/// been collected.
pub(crate) struct ScriptedHandle {
    pub pid: u32,
    pub alive_from: Option<u32>,
    pub exit_at: Option<(u32, ExitReason)>,
    pub liveness_checks: Arc<AtomicU32>,
    pub status_queries: AtomicU32,
    pub killed: Arc<AtomicBool>,
    reaped: AtomicBool,
}

impl ScriptedHandle {
    pub fn new(pid: u32, alive_from: Option<u32>) -> Self {
        Self {
            pid,
            alive_from,
            exit_at: None,
            liveness_checks: Arc::new(AtomicU32::new(0)),
            status_queries: AtomicU32::new(0),
            killed: Arc::new(AtomicBool::new(false)),
            reaped: AtomicBool::new(false),
        }
    }

    fn reap(&self) -> Option<ExitReason> {
        let reason = self.exit_reason();
        if reason.is_some() {
            self.reaped.store(true, Ordering::SeqCst);
        }
        reason
    }

    fn exit_reason(&self) -> Option<ExitReason> {
        if self.killed.load(Ordering::SeqCst) {
            return Some(ExitReason {
                code: None,
                signal: Some(TERM_SIGNAL),
            });
        }

        let queries = self.status_queries.load(Ordering::SeqCst);
        self.exit_at
            .filter(|(at, _)| queries >= *at)
            .map(|(_, reason)| reason)
    }
}

#[async_trait]
impl ProcessHandle for ScriptedHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        (!self.reaped.load(Ordering::SeqCst)).then_some(ProcessId(self.pid))
    }

    fn get_command(&self) -> &str {
        "scripted-backend"
    }

    async fn is_running(&self) -> bool {
        let check = self.liveness_checks.fetch_add(1, Ordering::SeqCst) + 1;
        !self.killed.load(Ordering::SeqCst) && self.alive_from.is_some_and(|from| check >= from)
    }

    async fn try_wait(&mut self) -> anyhow::Result<Option<ExitReason>> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.reap())
    }

    async fn wait(&mut self) -> anyhow::Result<ExitReason> {
        loop {
            if let Some(reason) = self.reap() {
                return Ok(reason);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.status_queries.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Probe answering from a script, then repeating its last answer
pub(crate) struct ScriptedProbe {
    answers: Mutex<Vec<bool>>,
    fail: bool,
    pub calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn new(answers: Vec<bool>) -> Self {
        Self {
            answers: Mutex::new(answers),
            fail: false,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl PortProbe for ScriptedProbe {
    async fn is_reachable(&self, endpoint: &Endpoint) -> Result<bool, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProbeError::InvalidAddress {
                endpoint: endpoint.to_string(),
                reason: "scripted failure".to_string(),
            });
        }

        let mut answers = self.answers.lock().unwrap();
        if answers.len() > 1 {
            Ok(answers.remove(0))
        } else {
            Ok(answers.first().copied().unwrap_or(false))
        }
    }
}

/// Output stream that stays open and silent while the sender lives
pub(crate) fn silent_output() -> (mpsc::Sender<String>, OutputLines) {
    let (tx, rx) = mpsc::channel(16);
    (tx, OutputLines::from_receiver(rx, 10))
}

/// Process manager spawning `ScriptedHandle`s and recording what was done to them
pub(crate) struct ScriptedManager {
    pub alive_from: Option<u32>,
    pub exit_at: Option<(u32, ExitReason)>,
    pub fail_launch: bool,
    pub spawned: Arc<AtomicU32>,
    pub terminated: Arc<AtomicU32>,
    pub liveness_checks: Arc<AtomicU32>,
    pub emergency_killed: Arc<Mutex<Vec<ProcessId>>>,
    /// `killed` flag of every spawned handle, for dying behind the supervisor's back
    pub kill_switches: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
    outputs: Mutex<Vec<mpsc::Sender<String>>>,
}

#[async_trait]
impl ProcessLifecycle for ScriptedManager {
    type Handle = ScriptedHandle;

    async fn spawn_process(
        &self,
        spec: &LaunchSpec,
        recent_output_lines: usize,
    ) -> Result<(Self::Handle, OutputLines), LaunchError> {
        if self.fail_launch {
            return Err(LaunchError::ExecutableNotFound(spec.executable.clone()));
        }

        let n = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let mut handle = ScriptedHandle::new(4000 + n, self.alive_from);
        handle.exit_at = self.exit_at;
        handle.liveness_checks = self.liveness_checks.clone();
        self.kill_switches.lock().unwrap().push(handle.killed.clone());

        let (tx, rx) = mpsc::channel(16);
        self.outputs.lock().unwrap().push(tx);
        Ok((handle, OutputLines::from_receiver(rx, recent_output_lines)))
    }
}

#[async_trait]
impl ProcessTermination for ScriptedManager {
    async fn terminate_gracefully(&self, handle: &mut Self::Handle) -> TerminationResult {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        match handle.kill().await {
            Ok(()) => TerminationResult::Success,
            Err(e) => TerminationResult::Failed(e.to_string()),
        }
    }

    async fn force_kill(&self, handle: &mut Self::Handle) -> TerminationResult {
        self.terminate_gracefully(handle).await
    }

    fn emergency_kill(&self, pid: ProcessId) {
        self.emergency_killed.lock().unwrap().push(pid);
    }
}

impl ProcessManager for ScriptedManager {
    fn new() -> Self {
        Self {
            alive_from: Some(1),
            exit_at: None,
            fail_launch: false,
            spawned: Arc::new(AtomicU32::new(0)),
            terminated: Arc::new(AtomicU32::new(0)),
            liveness_checks: Arc::new(AtomicU32::new(0)),
            emergency_killed: Arc::new(Mutex::new(Vec::new())),
            kill_switches: Arc::new(Mutex::new(Vec::new())),
            outputs: Mutex::new(Vec::new()),
        }
    }
}
