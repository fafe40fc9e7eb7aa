use crate::config::{Endpoint, ReadinessConfig, ReadinessMode};
use crate::error::{ProbeError, SupervisorError};
use crate::launcher::SupervisedProcess;
use crate::probe::PortProbe;
use crate::process::{ExitReason, ProcessHandle};
use backon::{ConstantBuilder, Retryable};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal outcome of one `ensure_running` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessResult {
    /// Something was already serving the endpoint, or we already own a live backend
    AlreadyRunning,
    /// A backend was spawned and confirmed ready
    Started,
    /// A backend was spawned but never confirmed ready within the attempt budget
    TimedOut,
    /// The spawned backend died during the readiness window
    ProcessExited {
        reason: ExitReason,
        last_output: Vec<String>,
    },
}

impl ReadinessResult {
    /// True when the endpoint can be handed to a client
    pub fn is_reachable(&self) -> bool {
        matches!(self, ReadinessResult::AlreadyRunning | ReadinessResult::Started)
    }
}

impl fmt::Display for ReadinessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessResult::AlreadyRunning => write!(f, "backend already running"),
            ReadinessResult::Started => write!(f, "backend started"),
            ReadinessResult::TimedOut => write!(f, "backend did not become ready in time"),
            ReadinessResult::ProcessExited { reason, .. } => {
                write!(f, "backend exited during startup ({reason})")
            }
        }
    }
}

/// Why a single readiness attempt did not succeed
#[derive(Debug)]
enum AttemptError {
    NotReady,
    Exited {
        reason: ExitReason,
        last_output: Vec<String>,
    },
    Probe(ProbeError),
}

/// Polls a freshly spawned backend until it is ready or the budget runs out
pub struct ReadinessWatcher<P: PortProbe + ?Sized> {
    config: ReadinessConfig,
    endpoint: Endpoint,
    probe: Arc<P>,
}

impl<P: PortProbe + ?Sized> ReadinessWatcher<P> {
    pub fn new(config: ReadinessConfig, endpoint: Endpoint, probe: Arc<P>) -> Self {
        Self {
            config,
            endpoint,
            probe,
        }
    }

    /// Run up to `max_attempts` checks spaced `interval` apart.
    ///
    /// Attempts start on an `interval` grid: time spent waiting for output
    /// counts against the interval, so the whole budget is about
    /// `max_attempts * interval` as long as `line_timeout <= interval`.
    ///
    /// Returns `Err(Cancelled)` as soon as `cancel` fires; the process is left
    /// untouched so its owner can still terminate it.
    pub async fn await_ready<H: ProcessHandle>(
        &self,
        process: &mut SupervisedProcess<H>,
        cancel: &CancellationToken,
    ) -> Result<ReadinessResult, SupervisorError> {
        let max_attempts = self.config.max_attempts.max(1);
        info!(
            "Waiting for backend readiness (max {} attempts, {}ms interval, {:?} mode)",
            max_attempts, self.config.interval_ms, self.config.mode
        );

        let attempt = AtomicU32::new(0);
        let slot = Mutex::new(process);
        let began = Instant::now();
        // Micros from `began` to the start of the latest attempt
        let attempt_started = Arc::new(AtomicU64::new(0));

        let check = || async {
            let attempt = attempt.fetch_add(1, Ordering::Relaxed) + 1;
            attempt_started.store(began.elapsed().as_micros() as u64, Ordering::Relaxed);
            let mut process = slot.lock().await;
            self.check_once(&mut **process, attempt).await
        };

        let schedule = ConstantBuilder::default()
            .with_delay(self.config.interval())
            .with_max_times((max_attempts - 1) as usize);

        let started = attempt_started.clone();
        let pace = move |delay: Duration| {
            let last = began + Duration::from_micros(started.load(Ordering::Relaxed));
            sleep_until(last + delay)
        };

        let readiness = check
            .retry(schedule)
            .sleep(pace)
            .when(|e: &AttemptError| matches!(e, AttemptError::NotReady))
            .notify(|_, delay| {
                debug!("Backend not ready yet, next attempt {:?} after the last one started", delay)
            });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Readiness wait cancelled");
                return Err(SupervisorError::Cancelled);
            }
            outcome = readiness => outcome,
        };

        match outcome {
            Ok(()) => {
                info!(
                    attempts = attempt.load(Ordering::Relaxed),
                    "Backend is ready"
                );
                Ok(ReadinessResult::Started)
            }
            Err(AttemptError::NotReady) => {
                warn!(
                    "Backend not ready after {} attempts",
                    attempt.load(Ordering::Relaxed)
                );
                Ok(ReadinessResult::TimedOut)
            }
            Err(AttemptError::Exited {
                reason,
                last_output,
            }) => {
                warn!(%reason, "Backend exited before becoming ready");
                Ok(ReadinessResult::ProcessExited {
                    reason,
                    last_output,
                })
            }
            Err(AttemptError::Probe(e)) => Err(e.into()),
        }
    }

    async fn check_once<H: ProcessHandle>(
        &self,
        process: &mut SupervisedProcess<H>,
        attempt: u32,
    ) -> Result<(), AttemptError> {
        if let Some(reason) = exit_status(process).await {
            return Err(exited(process, reason, self.config.line_timeout()).await);
        }

        let line_timeout = self.config.line_timeout();
        let (handle, output) = process.parts_mut();
        match timeout(line_timeout, output.next_line()).await {
            Ok(Some(line)) => debug!(attempt, "Backend startup output: {line}"),
            Ok(None) => {
                // Output closed: the process is usually on its way out.
                if let Ok(Ok(reason)) = timeout(line_timeout, handle.wait()).await {
                    return Err(exited(process, reason, line_timeout).await);
                }
            }
            Err(_) => debug!(attempt, "No backend output within {:?}", line_timeout),
        }

        if let Some(reason) = exit_status(process).await {
            return Err(exited(process, reason, line_timeout).await);
        }

        if !process.handle().is_running().await {
            debug!(attempt, "Backend process not confirmed alive");
            return Err(AttemptError::NotReady);
        }

        if self.config.mode == ReadinessMode::PortBound
            && !self
                .probe
                .is_reachable(&self.endpoint)
                .await
                .map_err(AttemptError::Probe)?
        {
            debug!(attempt, endpoint = %self.endpoint, "Backend alive but port not bound yet");
            return Err(AttemptError::NotReady);
        }

        Ok(())
    }
}

async fn exit_status<H: ProcessHandle>(process: &mut SupervisedProcess<H>) -> Option<ExitReason> {
    match process.handle_mut().try_wait().await {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, "Failed to query backend exit status");
            None
        }
    }
}

/// Collect the output tail the backend wrote before dying
async fn exited<H: ProcessHandle>(
    process: &mut SupervisedProcess<H>,
    reason: ExitReason,
    drain_wait: Duration,
) -> AttemptError {
    let output = process.output_mut();
    let drained = output.drain_remaining(drain_wait).await;
    debug!(drained, "Collected remaining backend output after exit");

    AttemptError::Exited {
        reason,
        last_output: output.recent(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedHandle, ScriptedProbe, init_test_tracing, silent_output};
    use std::time::Duration;

    fn watcher(mode: ReadinessMode, probe: Arc<ScriptedProbe>) -> ReadinessWatcher<ScriptedProbe> {
        let config = ReadinessConfig {
            mode,
            ..Default::default()
        };
        ReadinessWatcher::new(config, Endpoint::default(), probe)
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_once_alive() {
        init_test_tracing();
        let handle = ScriptedHandle::new(100, Some(3));
        let checks = handle.liveness_checks.clone();
        let (_tx, output) = silent_output();
        let mut process = SupervisedProcess::new(handle, output, true);

        let watcher = watcher(ReadinessMode::Liveness, Arc::new(ScriptedProbe::new(vec![false])));
        let result = watcher
            .await_ready(&mut process, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, ReadinessResult::Started);
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_after_exact_attempts() {
        let handle = ScriptedHandle::new(100, None);
        let checks = handle.liveness_checks.clone();
        let (_tx, output) = silent_output();
        let mut process = SupervisedProcess::new(handle, output, true);

        let watcher = watcher(ReadinessMode::Liveness, Arc::new(ScriptedProbe::new(vec![false])));
        let started = tokio::time::Instant::now();
        let result = watcher
            .await_ready(&mut process, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, ReadinessResult::TimedOut);
        assert_eq!(checks.load(Ordering::SeqCst), 10);
        // Line waits count against the interval: 10 attempts at 500ms
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(4_500));
        assert!(elapsed <= Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_reported_with_output() {
        let mut handle = ScriptedHandle::new(100, Some(1));
        handle.exit_at = Some((
            2,
            ExitReason {
                code: Some(3),
                signal: None,
            },
        ));
        let (tx, output) = silent_output();
        for line in ["listening on 33445", "error: bind failed", "fatal: cannot bind"] {
            tx.send(line.to_string()).await.unwrap();
        }
        let mut process = SupervisedProcess::new(handle, output, true);

        let watcher = watcher(ReadinessMode::Liveness, Arc::new(ScriptedProbe::new(vec![false])));
        let result = watcher
            .await_ready(&mut process, &CancellationToken::new())
            .await
            .unwrap();

        match result {
            ReadinessResult::ProcessExited {
                reason,
                last_output,
            } => {
                assert_eq!(reason.code, Some(3));
                // Lines still queued at exit are part of the report
                assert_eq!(
                    last_output,
                    vec!["listening on 33445", "error: bind failed", "fatal: cannot bind"]
                );
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_output_then_exit() {
        let mut handle = ScriptedHandle::new(100, None);
        // attempt 1 reads the line, attempt 2 finds the stream closed and waits
        handle.exit_at = Some((
            4,
            ExitReason {
                code: Some(1),
                signal: None,
            },
        ));
        let (tx, output) = silent_output();
        tx.send("panic: config missing".to_string()).await.unwrap();
        drop(tx);
        let mut process = SupervisedProcess::new(handle, output, true);

        let watcher = watcher(ReadinessMode::Liveness, Arc::new(ScriptedProbe::new(vec![false])));
        let result = watcher
            .await_ready(&mut process, &CancellationToken::new())
            .await
            .unwrap();

        match result {
            ReadinessResult::ProcessExited {
                reason,
                last_output,
            } => {
                assert_eq!(reason.code, Some(1));
                assert_eq!(last_output, vec!["panic: config missing"]);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_bound_waits_for_listener() {
        let handle = ScriptedHandle::new(100, Some(1));
        let checks = handle.liveness_checks.clone();
        let (_tx, output) = silent_output();
        let mut process = SupervisedProcess::new(handle, output, true);

        let probe = Arc::new(ScriptedProbe::new(vec![false, false, false, true]));
        let watcher = watcher(ReadinessMode::PortBound, probe.clone());
        let result = watcher
            .await_ready(&mut process, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, ReadinessResult::Started);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
        assert_eq!(checks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_prompt() {
        let handle = ScriptedHandle::new(100, None);
        let checks = handle.liveness_checks.clone();
        let (_tx, output) = silent_output();
        let mut process = SupervisedProcess::new(handle, output, true);

        let watcher = watcher(ReadinessMode::Liveness, Arc::new(ScriptedProbe::new(vec![false])));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_200)).await;
            trigger.cancel();
        });

        let result = watcher.await_ready(&mut process, &cancel).await;
        assert!(matches!(result, Err(SupervisorError::Cancelled)));
        assert!(checks.load(Ordering::SeqCst) < 10);
        assert!(process.owned_by_supervisor());
    }
}
