use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use hearth_process::ProcessStatus;
use tokio::{
    process::{Child, Command},
    sync::{Mutex, mpsc, watch},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SupervisorConfig,
    console_io::{self, CONSOLE_LOG_TARGET, ConsoleWorkers},
    hooks::LifecycleHooks,
};

/// How long console readers get to flush trailing output after the process exits.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Decides whether the configured executable is present. Checked on every
/// start attempt so a freshly downloaded server counts.
pub trait PathValidator: Send + Sync {
    fn is_existing_file(&self, path: &Path) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsPathValidator;

impl PathValidator for FsPathValidator {
    fn is_existing_file(&self, path: &Path) -> bool {
        path.is_file()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("start requires a prior successful init_start (status is {0})")]
    NotInitialized(ProcessStatus),
    #[error("game process is already attached")]
    AlreadyRunning,
    #[error("failed to spawn `{command}` in {}", dir.display())]
    Spawn {
        command: String,
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("game process is not running")]
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
}

#[derive(Debug)]
struct Running {
    pid: Option<u32>,
    input: mpsc::UnboundedSender<String>,
    exited: watch::Receiver<Option<ExitOutcome>>,
    kill: CancellationToken,
}

struct Inner {
    config: SupervisorConfig,
    hooks: LifecycleHooks,
    paths: Arc<dyn PathValidator>,
    status: AtomicU8,
    running: Mutex<Option<Running>>,
}

/// Owns the lifecycle of the single game process.
///
/// Cheap to clone; all clones drive the same process.
#[derive(Clone)]
pub struct GameSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GameSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameSupervisor")
            .field("status", &self.status())
            .field("executable", &self.inner.config.executable_path())
            .finish()
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // The game must not outlive us if we crash.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            set_parent_death_signal()?;
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_child(child: &mut Child, pgid: Option<i32>) {
    if let Some(pgid) = pgid {
        // The session leader's pid doubles as the group id.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn kill_child(child: &mut Child, _pgid: Option<i32>) {
    let _ = child.start_kill();
}

async fn wait_for_exit(mut exited: watch::Receiver<Option<ExitOutcome>>, timeout: Duration) -> bool {
    // A dropped sender means the exit task is gone, which only happens after exit.
    tokio::time::timeout(timeout, async move {
        let _ = exited.wait_for(Option::is_some).await;
    })
    .await
    .is_ok()
}

impl GameSupervisor {
    pub fn new(config: SupervisorConfig, hooks: LifecycleHooks) -> Self {
        Self::with_path_validator(config, hooks, Arc::new(FsPathValidator))
    }

    pub fn with_path_validator(
        config: SupervisorConfig,
        hooks: LifecycleHooks,
        paths: Arc<dyn PathValidator>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                hooks,
                paths,
                status: AtomicU8::new(ProcessStatus::Down.as_u8()),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Lock-free read of the current lifecycle state.
    pub fn status(&self) -> ProcessStatus {
        ProcessStatus::from_u8(self.inner.status.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ProcessStatus, to: ProcessStatus) -> bool {
        debug_assert!(from.can_transition_to(to), "illegal status transition {from} -> {to}");
        let ok = self
            .inner
            .status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if ok {
            tracing::debug!(%from, %to, "game status changed");
        }
        ok
    }

    fn force_status(&self, to: ProcessStatus) {
        let from = ProcessStatus::from_u8(self.inner.status.swap(to.as_u8(), Ordering::SeqCst));
        if from != to {
            debug_assert!(from.can_transition_to(to), "illegal status transition {from} -> {to}");
            tracing::debug!(%from, %to, "game status changed");
        }
    }

    /// Claims the right to start. Of any number of concurrent callers at most
    /// one gets `true`, and only if the executable exists right now.
    pub fn init_start(&self) -> bool {
        if self.status() != ProcessStatus::Down {
            return false;
        }
        let path = self.inner.config.executable_path();
        if !self.inner.paths.is_existing_file(&path) {
            tracing::warn!(path = %path.display(), "game executable missing; refusing to start");
            return false;
        }
        self.transition(ProcessStatus::Down, ProcessStatus::Starting)
    }

    /// Spawns the game. Returns once the process and its console workers are
    /// running; the process lifetime is observed in the background.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let status = self.status();
        if status != ProcessStatus::Starting {
            return Err(SupervisorError::NotInitialized(status));
        }

        let mut slot = self.inner.running.lock().await;
        if slot.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let cfg = &self.inner.config;
        let command_line = cfg.start_command.join(" ");
        let spawned = match cfg.start_command.split_first() {
            Some((program, args)) => {
                let mut cmd = Command::new(program);
                cmd.args(args)
                    .current_dir(&cfg.game_dir)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                isolate_process_group(&mut cmd);
                cmd.spawn()
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty start command",
            )),
        };

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                self.force_status(ProcessStatus::Down);
                tracing::error!(
                    command = %command_line,
                    dir = %cfg.game_dir.display(),
                    error = %source,
                    "failed to spawn game process"
                );
                return Err(SupervisorError::Spawn {
                    command: command_line,
                    dir: cfg.game_dir.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        let pgid = pid.and_then(|p| i32::try_from(p).ok());
        tracing::info!(?pid, command = %command_line, dir = %cfg.game_dir.display(), "game process spawned");
        self.inner.hooks.process_started();

        let mut workers = ConsoleWorkers::new(CancellationToken::new());
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        if let Some(stdin) = child.stdin.take() {
            workers.push(console_io::spawn_stdin_writer(stdin, input_rx, workers.token()));
        }
        if let Some(out) = child.stdout.take() {
            let sup = self.clone();
            workers.push(console_io::spawn_line_reader(out, "stdout", workers.token(), move |line| {
                sup.on_console_line(&line)
            }));
        }
        if let Some(err) = child.stderr.take() {
            let sup = self.clone();
            workers.push(console_io::spawn_line_reader(err, "stderr", workers.token(), move |line| {
                sup.on_console_line(&line)
            }));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        *slot = Some(Running {
            pid,
            input: input_tx,
            exited: exit_rx,
            kill: kill.clone(),
        });
        drop(slot);

        let sup = self.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                res = child.wait() => res,
                _ = kill.cancelled() => {
                    kill_child(&mut child, pgid);
                    child.wait().await
                }
            };
            let code = match waited {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to collect game exit status");
                    None
                }
            };

            // Dropping the slot closes the input queue so the writer ends.
            sup.inner.running.lock().await.take();
            sup.force_status(ProcessStatus::Down);
            tracing::info!(?pid, exit_code = ?code, "game process exited");
            let _ = exit_tx.send(Some(ExitOutcome { code }));
            sup.inner.hooks.process_exited(code);

            // Down does not wait on the readers; they get a short grace to
            // flush trailing output before being cancelled.
            workers.drain(OUTPUT_DRAIN_GRACE).await;
        });

        Ok(())
    }

    fn on_console_line(&self, line: &str) {
        tracing::info!(target: CONSOLE_LOG_TARGET, "{line}");
        self.inner.hooks.input_line(line);

        let cfg = &self.inner.config;
        match self.status() {
            ProcessStatus::Starting if cfg.ready_pattern.is_match(line) => {
                if self.transition(ProcessStatus::Starting, ProcessStatus::Up) {
                    tracing::info!("game is ready");
                    self.inner.hooks.game_ready();
                }
            }
            ProcessStatus::Up if cfg.stopping_pattern.is_match(line) => {
                if self.transition(ProcessStatus::Up, ProcessStatus::Stopping) {
                    tracing::info!("game is stopping on its own");
                    self.inner.hooks.game_stopping();
                }
            }
            _ => {}
        }
    }

    /// Claims the right to stop; only succeeds while `Up`.
    pub fn init_stop(&self) -> bool {
        if !self.transition(ProcessStatus::Up, ProcessStatus::Stopping) {
            return false;
        }
        self.inner.hooks.game_stopping();
        true
    }

    /// Queues a line for the game's stdin.
    pub async fn send_line(&self, line: &str) -> Result<(), SupervisorError> {
        let slot = self.inner.running.lock().await;
        let running = slot.as_ref().ok_or(SupervisorError::NotRunning)?;
        running
            .input
            .send(line.to_string())
            .map_err(|_| SupervisorError::NotRunning)
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.running.lock().await.as_ref().and_then(|r| r.pid)
    }

    /// Asks the game to stop via its console and waits up to `timeout` for it
    /// to exit. Returns whether it did; a timeout is not an error.
    pub async fn stop(&self, timeout: Duration) -> bool {
        if self.status() == ProcessStatus::Down {
            return true;
        }
        if self.transition(ProcessStatus::Up, ProcessStatus::Stopping) {
            self.inner.hooks.game_stopping();
        }

        let exited = {
            let slot = self.inner.running.lock().await;
            let Some(running) = slot.as_ref() else {
                return self.status() == ProcessStatus::Down;
            };
            if running.input.send(self.inner.config.stop_command.clone()).is_err() {
                tracing::warn!("stop command could not be queued");
            }
            running.exited.clone()
        };

        tracing::info!(timeout_ms = timeout.as_millis() as u64, "waiting for game to stop");
        wait_for_exit(exited, timeout).await
    }

    /// [`GameSupervisor::stop`], then kill and wait up to `timeout` again.
    pub async fn stop_forcibly(&self, timeout: Duration) -> bool {
        if self.stop(timeout).await {
            return true;
        }

        tracing::warn!(
            timeout_ms = timeout.as_millis() as u64,
            "graceful stop timed out; killing game process"
        );
        let exited = {
            let slot = self.inner.running.lock().await;
            let Some(running) = slot.as_ref() else {
                return self.status() == ProcessStatus::Down;
            };
            running.kill.cancel();
            running.exited.clone()
        };
        wait_for_exit(exited, timeout).await
    }
}
