//! Process Supervisor for the EVerest manager
//!
//! Spawns the manager on the composed config, forwards its output to the
//! log under the `everest` target and waits for a readiness line. Stopping
//! interrupts the process, waits for it, then removes the session's temp
//! directories and puts back any user config that was moved aside.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Logged by the manager once every module reported ready
pub const READY_LINE: &str = "all modules are ready";

/// Logged by the manager when a module is left for an external process
pub const STANDALONE_READY_LINE: &str = "Not starting standalone module";

const TAIL_LINES: usize = 50;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const BACKUP_SUFFIX: &str = "evt-backup";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("EVerest not ready after {after:?}\n{}", .last_lines.join("\n"))]
    StartupTimeout { after: Duration, last_lines: Vec<String> },

    #[error("EVerest exited during startup with {status}\n{}", .last_lines.join("\n"))]
    ExitedEarly {
        status: ExitStatus,
        last_lines: Vec<String>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("EVerest is not running")]
    NotRunning,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Manager executable, `<prefix>/bin/manager` by default
    pub manager_binary: PathBuf,
    /// EVerest installation prefix
    pub prefix: PathBuf,
    /// Composed EVerest config to run
    pub config_path: PathBuf,
    /// Template the config was composed from; its user config is moved aside
    pub template_path: Option<PathBuf>,
    /// Modules left for external processes
    pub standalone: Vec<String>,
    /// Lines that signal readiness; derived from `standalone` when empty
    pub readiness_patterns: Vec<String>,
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub extra_args: Vec<String>,
}

impl SupervisorConfig {
    pub fn new(prefix: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        Self {
            manager_binary: prefix.join("bin").join("manager"),
            prefix,
            config_path: config_path.into(),
            template_path: None,
            standalone: Vec::new(),
            readiness_patterns: Vec::new(),
            startup_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            working_dir: None,
            env: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_manager_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.manager_binary = binary.into();
        self
    }

    pub fn with_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.template_path = Some(template.into());
        self
    }

    pub fn with_standalone(mut self, module_id: impl Into<String>) -> Self {
        self.standalone.push(module_id.into());
        self
    }

    pub fn with_readiness_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.readiness_patterns.push(pattern.into());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    fn readiness(&self) -> Vec<String> {
        if !self.readiness_patterns.is_empty() {
            return self.readiness_patterns.iter().map(|p| p.to_lowercase()).collect();
        }
        let line = if self.standalone.is_empty() {
            READY_LINE
        } else {
            STANDALONE_READY_LINE
        };
        vec![line.to_lowercase()]
    }

    /// `user-config/<name>.yaml` beside the template
    pub fn user_config_path(&self) -> Option<PathBuf> {
        let template = self.template_path.as_ref()?;
        let stem = template.file_stem()?;
        let dir = template.parent().unwrap_or_else(|| Path::new("."));
        Some(dir.join("user-config").join(stem).with_extension("yaml"))
    }
}

/// A user config moved aside for the session
#[derive(Debug)]
struct Displaced {
    original: PathBuf,
    backup: PathBuf,
}

impl Displaced {
    fn take(original: PathBuf) -> Result<Option<Self>, std::io::Error> {
        if !original.exists() {
            return Ok(None);
        }
        let mut backup = original.clone().into_os_string();
        backup.push(".");
        backup.push(BACKUP_SUFFIX);
        let backup = PathBuf::from(backup);
        std::fs::rename(&original, &backup)?;
        info!("Moved user config {} aside", original.display());
        Ok(Some(Self { original, backup }))
    }

    fn restore(self) -> Result<(), std::io::Error> {
        std::fs::rename(&self.backup, &self.original)?;
        info!("Restored user config {}", self.original.display());
        Ok(())
    }
}

/// Running EVerest instance
pub struct Supervisor {
    config: SupervisorConfig,
    child: Option<Child>,
    tail: Arc<Mutex<VecDeque<String>>>,
    readers: Vec<JoinHandle<()>>,
    temp_dirs: Vec<TempDir>,
    displaced: Option<Displaced>,
}

impl Supervisor {
    /// Spawn the manager and wait until it reports ready
    pub async fn start(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let displaced = match config.user_config_path() {
            Some(path) => Displaced::take(path)?,
            None => None,
        };

        let mut supervisor = Self {
            config,
            child: None,
            tail: Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES))),
            readers: Vec::new(),
            temp_dirs: Vec::new(),
            displaced,
        };

        match supervisor.spawn_and_wait().await {
            Ok(()) => Ok(supervisor),
            Err(e) => {
                if let Err(stop_err) = supervisor.stop().await {
                    warn!("Cleanup after failed start: {}", stop_err);
                }
                Err(e)
            }
        }
    }

    async fn spawn_and_wait(&mut self) -> Result<(), SupervisorError> {
        let config = &self.config;
        let mut command = Command::new(&config.manager_binary);
        command
            .arg("--prefix")
            .arg(&config.prefix)
            .arg("--config")
            .arg(&config.config_path);
        for module in &config.standalone {
            command.arg("--standalone").arg(module);
        }
        command
            .args(&config.extra_args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            binary: config.manager_binary.clone(),
            source,
        })?;
        info!(
            "Started {} (pid {:?}) on {}",
            config.manager_binary.display(),
            child.id(),
            config.config_path.display()
        );

        let (ready_tx, mut ready_rx) = watch::channel(false);
        let ready_tx = Arc::new(ready_tx);
        let patterns = Arc::new(config.readiness());
        if let Some(stdout) = child.stdout.take() {
            self.readers
                .push(forward_lines(stdout, self.tail.clone(), patterns.clone(), ready_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers
                .push(forward_lines(stderr, self.tail.clone(), patterns, ready_tx));
        }

        let started = Instant::now();
        let deadline = started + self.config.startup_timeout;
        let result = loop {
            if *ready_rx.borrow() {
                info!("EVerest ready after {:?}", started.elapsed());
                break Ok(());
            }
            if let Some(status) = child.try_wait()? {
                break Err(SupervisorError::ExitedEarly {
                    status,
                    last_lines: self.last_lines(),
                });
            }
            if Instant::now() >= deadline {
                break Err(SupervisorError::StartupTimeout {
                    after: self.config.startup_timeout,
                    last_lines: self.last_lines(),
                });
            }
            tokio::select! {
                changed = ready_rx.changed() => {
                    // both output streams closed, keep polling the exit status
                    if changed.is_err() {
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        };

        self.child = Some(child);
        result
    }

    /// Hand a temp directory over to be removed at stop
    pub fn adopt(&mut self, dir: TempDir) {
        self.temp_dirs.push(dir);
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Most recent output lines, oldest first
    pub fn last_lines(&self) -> Vec<String> {
        self.tail.lock().iter().cloned().collect()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Interrupt and reap the process, then clean up the session
    ///
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned.
    pub async fn stop(&mut self) -> Result<Option<ExitStatus>, SupervisorError> {
        let mut first_error: Option<SupervisorError> = None;

        let status = match self.child.take() {
            Some(mut child) => match terminate(&mut child, self.config.stop_timeout).await {
                Ok(status) => {
                    info!("EVerest stopped with {}", status);
                    Some(status)
                }
                Err(e) => {
                    warn!("Stopping EVerest failed: {}", e);
                    first_error.get_or_insert(e.into());
                    None
                }
            },
            None => None,
        };

        for reader in self.readers.drain(..) {
            if tokio::time::timeout(Duration::from_secs(1), reader).await.is_err() {
                debug!("Output reader still open after stop");
            }
        }

        for dir in self.temp_dirs.drain(..) {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    first_error.get_or_insert(e.into());
                }
            }
        }

        if let Some(displaced) = self.displaced.take() {
            if let Err(e) = displaced.restore() {
                warn!("Failed to restore user config: {}", e);
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(status),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        for reader in &self.readers {
            reader.abort();
        }
        if let Some(displaced) = self.displaced.take() {
            if let Err(e) = displaced.restore() {
                warn!("Failed to restore user config: {}", e);
            }
        }
    }
}

fn forward_lines<R>(
    stream: R,
    tail: Arc<Mutex<VecDeque<String>>>,
    patterns: Arc<Vec<String>>,
    ready: Arc<watch::Sender<bool>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "everest", "{}", line);

            let lowered = line.to_lowercase();
            if patterns.iter().any(|p| lowered.contains(p.as_str())) {
                ready.send_replace(true);
            }

            let mut tail = tail.lock();
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

async fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus, std::io::Error> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we have not reaped yet
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
        }
    }
    #[cfg(not(unix))]
    child.start_kill()?;

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("EVerest ignored the interrupt for {:?}, killing it", grace);
            child.kill().await?;
            child.wait().await
        }
    }
}
