//! In-memory backend for tests
//!
//! The submitted "code" is a script, one command per line:
//!
//! | command       | effect                                       |
//! |---------------|----------------------------------------------|
//! | `out:<text>`  | write `<text>\n` to stdout                   |
//! | `err:<text>`  | write `<text>\n` to stderr                   |
//! | `bytes:<n>`   | write `n` bytes of `x` to stdout             |
//! | `sleep:<ms>`  | pause                                        |
//! | `hang`        | pause until terminated or killed             |
//! | `trap`        | ignore `terminate` from here on              |
//! | `exit:<n>`    | exit with code `n`                           |
//! | `signal:<n>`  | die from signal `n`                          |
//!
//! A script that runs off its end exits with code 0. Unknown lines are
//! ignored.

use super::{Backend, BackendHandle, ExitOutcome, ProcessControl, ProvisionSpec, RunningProcess};
use crate::error::{ProvisionError, RunError};
use crate::language::validate_libraries;
use crate::limits::Limits;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::OutputStream;

const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

#[derive(Default)]
struct State {
    live: HashSet<BackendHandle>,
    disposals: HashMap<BackendHandle, usize>,
    installed: HashMap<BackendHandle, Vec<String>>,
}

#[derive(Default)]
struct Counters {
    provision_calls: AtomicUsize,
    dispose_calls: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

/// Backend double whose processes follow a line script
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<State>>,
    counters: Arc<Counters>,
    provision_delay: Duration,
    run_delay: Duration,
    provision_failure: Option<ProvisionError>,
    run_failure: Option<RunError>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every provision take `delay`
    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.provision_delay = delay;
        self
    }

    /// Make every run take `delay` before the process starts
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// Make every provision fail with `error`
    pub fn fail_provisioning(mut self, error: ProvisionError) -> Self {
        self.provision_failure = Some(error);
        self
    }

    /// Make every run fail to start with `error`
    pub fn fail_runs(mut self, error: RunError) -> Self {
        self.run_failure = Some(error);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn provision_calls(&self) -> usize {
        self.counters.provision_calls.load(Ordering::SeqCst)
    }

    pub fn dispose_calls(&self) -> usize {
        self.counters.dispose_calls.load(Ordering::SeqCst)
    }

    /// How often `dispose` was called for `handle`
    pub fn disposals_for(&self, handle: &BackendHandle) -> usize {
        self.state().disposals.get(handle).copied().unwrap_or(0)
    }

    /// Every handle `dispose` was called for, with its call count
    pub fn disposals(&self) -> HashMap<BackendHandle, usize> {
        self.state().disposals.clone()
    }

    /// Handles provisioned and not yet disposed
    pub fn live_handles(&self) -> usize {
        self.state().live.len()
    }

    /// Libraries installed into `handle`, in order
    pub fn installed(&self, handle: &BackendHandle) -> Vec<String> {
        self.state().installed.get(handle).cloned().unwrap_or_default()
    }

    /// Processes currently running
    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::SeqCst)
    }

    /// Highest number of processes that ever ran at once
    pub fn peak_running(&self) -> usize {
        self.counters.peak_running.load(Ordering::SeqCst)
    }
}

/// Takes the handle back out of the live set if provisioning is abandoned
struct PendingHandle<'a> {
    state: &'a Mutex<State>,
    handle: Option<BackendHandle>,
}

impl Drop for PendingHandle<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.live.remove(&handle);
            state.installed.remove(&handle);
        }
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<BackendHandle, ProvisionError> {
        self.counters.provision_calls.fetch_add(1, Ordering::SeqCst);
        validate_libraries(&spec.libraries)?;

        let handle = BackendHandle::new();
        self.state().live.insert(handle.clone());
        let mut pending = PendingHandle {
            state: &self.state,
            handle: Some(handle.clone()),
        };

        if !self.provision_delay.is_zero() {
            tokio::time::sleep(self.provision_delay).await;
        }
        if let Some(error) = &self.provision_failure {
            return Err(error.clone());
        }
        self.install(&handle, &spec.libraries).await?;

        pending.handle = None;
        Ok(handle)
    }

    async fn install(
        &self,
        handle: &BackendHandle,
        libraries: &[String],
    ) -> Result<(), ProvisionError> {
        validate_libraries(libraries)?;
        let mut state = self.state();
        if !state.live.contains(handle) {
            return Err(ProvisionError::Backend(format!("unknown handle {}", handle)));
        }
        state
            .installed
            .entry(handle.clone())
            .or_default()
            .extend(libraries.iter().cloned());
        Ok(())
    }

    async fn run(
        &self,
        handle: &BackendHandle,
        code: &str,
        _limits: &Limits,
    ) -> Result<RunningProcess, RunError> {
        if !self.state().live.contains(handle) {
            return Err(RunError::UnknownHandle(handle.to_string()));
        }
        if let Some(error) = &self.run_failure {
            return Err(error.clone());
        }
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }

        let (stdout_tx, stdout_rx) = mpsc::channel(16);
        let (stderr_tx, stderr_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = watch::channel(None);
        let terminate = CancellationToken::new();
        let kill = CancellationToken::new();

        let running = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .peak_running
            .fetch_max(running, Ordering::SeqCst);

        let script = Script {
            lines: code.lines().map(str::to_string).collect(),
            stdout: stdout_tx,
            stderr: stderr_tx,
            terminate: terminate.clone(),
            kill: kill.clone(),
        };
        let counters = self.counters.clone();
        tokio::spawn(async move {
            let outcome = script.play().await;
            counters.running.fetch_sub(1, Ordering::SeqCst);
            let _ = exit_tx.send(Some(outcome));
        });

        Ok(RunningProcess {
            stdout: channel_stream(stdout_rx),
            stderr: channel_stream(stderr_rx),
            control: Box::new(ScriptControl {
                exit: exit_rx,
                terminate,
                kill,
            }),
        })
    }

    async fn dispose(&self, handle: &BackendHandle) {
        self.counters.dispose_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        *state.disposals.entry(handle.clone()).or_default() += 1;
        state.live.remove(handle);
    }
}

fn channel_stream(rx: mpsc::Receiver<Bytes>) -> OutputStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok(chunk), rx))
    })
    .boxed()
}

struct Script {
    lines: Vec<String>,
    stdout: mpsc::Sender<Bytes>,
    stderr: mpsc::Sender<Bytes>,
    terminate: CancellationToken,
    kill: CancellationToken,
}

impl Script {
    async fn play(self) -> ExitOutcome {
        let mut trapped = false;
        for line in &self.lines {
            let (command, arg) = line.split_once(':').unwrap_or((line.as_str(), ""));
            match command.trim() {
                "out" => {
                    let _ = self.stdout.send(Bytes::from(format!("{}\n", arg))).await;
                }
                "err" => {
                    let _ = self.stderr.send(Bytes::from(format!("{}\n", arg))).await;
                }
                "bytes" => {
                    let n = arg.trim().parse().unwrap_or(0);
                    let _ = self.stdout.send(Bytes::from(vec![b'x'; n])).await;
                }
                "sleep" => {
                    let ms = arg.trim().parse().unwrap_or(0);
                    if let Some(outcome) = self.pause(Some(Duration::from_millis(ms)), trapped).await
                    {
                        return outcome;
                    }
                }
                "hang" => {
                    if let Some(outcome) = self.pause(None, trapped).await {
                        return outcome;
                    }
                }
                "trap" => trapped = true,
                "exit" => return ExitOutcome::Exited(arg.trim().parse().unwrap_or(0)),
                "signal" => return ExitOutcome::Signaled(arg.trim().parse().unwrap_or(SIGKILL)),
                _ => {}
            }
            if self.kill.is_cancelled() {
                return ExitOutcome::Signaled(SIGKILL);
            }
            if !trapped && self.terminate.is_cancelled() {
                return ExitOutcome::Signaled(SIGTERM);
            }
        }
        ExitOutcome::Exited(0)
    }

    /// Sleep for `duration` (forever when `None`); returns the outcome if a
    /// signal ended the process meanwhile
    async fn pause(&self, duration: Option<Duration>, trapped: bool) -> Option<ExitOutcome> {
        let sleep = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => futures::future::pending::<()>().await,
            }
        };
        let terminated = async {
            if trapped {
                futures::future::pending::<()>().await;
            } else {
                self.terminate.cancelled().await;
            }
        };
        tokio::select! {
            _ = sleep => None,
            _ = self.kill.cancelled() => Some(ExitOutcome::Signaled(SIGKILL)),
            _ = terminated => Some(ExitOutcome::Signaled(SIGTERM)),
        }
    }
}

struct ScriptControl {
    exit: watch::Receiver<Option<ExitOutcome>>,
    terminate: CancellationToken,
    kill: CancellationToken,
}

#[async_trait]
impl ProcessControl for ScriptControl {
    async fn wait(&mut self) -> Result<ExitOutcome, RunError> {
        loop {
            let current = *self.exit.borrow();
            if let Some(outcome) = current {
                return Ok(outcome);
            }
            self.exit
                .changed()
                .await
                .map_err(|_| RunError::Backend("script task ended without an outcome".into()))?;
        }
    }

    async fn terminate(&mut self) {
        self.terminate.cancel();
    }

    async fn kill(&mut self) {
        self.kill.cancel();
    }
}
