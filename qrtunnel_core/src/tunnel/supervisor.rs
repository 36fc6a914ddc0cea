//! Tunnel subprocess supervision.
//!
//! One background task owns the child process. It reads stdout and stderr
//! line by line, publishes state changes on a watch channel and is the only
//! place that terminates or reaps the process.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::scanner::{LineEvent, LineScanner, clean_line};
use crate::config::TunnelConfig;
use crate::error::{Result, ShareError};

/// How long to keep reading output after the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Longer output lines are cut off and never scanned for a URL
const MAX_LINE_BYTES: usize = 8 * 1024;
/// Cap on output collected after the process exits
const MAX_DRAIN_BYTES: u64 = 64 * 1024;
/// Characters of an overlong line kept for error reports
const OVERLONG_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelFailure {
    /// The process could not be spawned
    Start(String),
    /// No URL within the configured window
    Timeout { after: Duration, diagnostic: String },
    /// The provider refused the tunnel before a URL appeared
    Rejected { diagnostic: String },
    /// The process exited on its own
    Exited { status: String, diagnostic: String },
}

impl From<TunnelFailure> for ShareError {
    fn from(failure: TunnelFailure) -> Self {
        match failure {
            TunnelFailure::Start(reason) => ShareError::TunnelStart(reason),
            TunnelFailure::Timeout { after, diagnostic } => ShareError::TunnelTimeout {
                timeout: after,
                diagnostic,
            },
            TunnelFailure::Rejected { diagnostic } => {
                ShareError::TunnelStart(format!("provider rejected the tunnel\n\n{}", diagnostic))
            }
            TunnelFailure::Exited { status, diagnostic } => {
                ShareError::TunnelExit { status, diagnostic }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    AwaitingUrl,
    Active { url: String },
    /// Stopped on request
    Closed,
    Failed(TunnelFailure),
}

impl TunnelState {
    /// True once the tunnel has either produced a URL or finished.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Starting | Self::AwaitingUrl)
    }

    pub fn public_url(&self) -> Option<&str> {
        match self {
            Self::Active { url } => Some(url),
            _ => None,
        }
    }
}

/// Caller's side of a running tunnel.
pub struct TunnelHandle {
    local_port: u16,
    state: watch::Receiver<TunnelState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TunnelHandle {
    /// Assemble a handle around any task that publishes `TunnelState`
    /// and stops when `shutdown` is cancelled.
    pub fn from_parts(
        local_port: u16,
        state: watch::Receiver<TunnelState>,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            local_port,
            state,
            shutdown,
            task: Some(task),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Wait for the first URL or failure.
    pub async fn wait_settled(&mut self) -> TunnelState {
        self.wait_until(TunnelState::is_settled).await
    }

    /// Wait until the tunnel is no longer active.
    pub async fn wait_inactive(&mut self) -> TunnelState {
        self.wait_until(|s| !matches!(s, TunnelState::Active { .. })).await
    }

    async fn wait_until(&mut self, done: impl FnMut(&TunnelState) -> bool) -> TunnelState {
        let result = self.state.wait_for(done).await.map(|state| state.clone());
        match result {
            Ok(state) => state,
            Err(_) => {
                // supervisor dropped its sender without settling
                let last = self.state.borrow().clone();
                match last {
                    TunnelState::Starting | TunnelState::AwaitingUrl | TunnelState::Active { .. } => {
                        TunnelState::Failed(TunnelFailure::Exited {
                            status: "supervisor stopped".to_string(),
                            diagnostic: String::new(),
                        })
                    }
                    settled => settled,
                }
            }
        }
    }

    /// Stop the tunnel and wait for the process to be reaped. Idempotent.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        let Some(task) = self.task.take() else {
            return;
        };
        debug!("Closing tunnel for local port {}", self.local_port);
        if let Err(e) = task.await {
            warn!("Tunnel supervisor ended abnormally: {}", e);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        // the supervisor still terminates the child; kill_on_drop covers runtime shutdown
        self.shutdown.cancel();
    }
}

/// Something that can open a public tunnel to a local port.
pub trait TunnelLauncher: Send + Sync {
    fn launch(&self, local_port: u16) -> Result<TunnelHandle>;
}

/// Launches the configured SSH reverse tunnel.
pub struct SshTunnelLauncher {
    config: TunnelConfig,
    scanner: Arc<LineScanner>,
}

impl SshTunnelLauncher {
    pub fn new(config: TunnelConfig) -> Self {
        let scanner = Arc::new(LineScanner::from_config(&config));
        Self { config, scanner }
    }

    /// Use a custom scanner, e.g. for a provider with a different URL format.
    pub fn with_scanner(config: TunnelConfig, scanner: LineScanner) -> Self {
        Self {
            config,
            scanner: Arc::new(scanner),
        }
    }
}

impl TunnelLauncher for SshTunnelLauncher {
    fn launch(&self, local_port: u16) -> Result<TunnelHandle> {
        let args = self.config.args_for_port(local_port);
        info!(
            "Starting tunnel: {} {}",
            self.config.program,
            args.join(" ")
        );

        // stdin stays open: the provider closes the session on EOF
        let child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ShareError::from(spawn_failure(&self.config.program, &e)))?;

        let (state_tx, state_rx) = watch::channel(TunnelState::Starting);
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor {
            state: state_tx,
            scanner: self.scanner.clone(),
            diagnostics: Diagnostics::new(self.config.diagnostic_lines),
            url_timeout: self.config.url_timeout(),
            grace: self.config.shutdown_grace(),
        };
        let task = tokio::spawn(supervisor.run(child, shutdown.clone()));

        Ok(TunnelHandle::from_parts(local_port, state_rx, shutdown, task))
    }
}

fn spawn_failure(program: &str, err: &std::io::Error) -> TunnelFailure {
    if err.kind() == std::io::ErrorKind::NotFound {
        TunnelFailure::Start(format!(
            "'{}' not found. Install an OpenSSH client and make sure it is on PATH",
            program
        ))
    } else {
        TunnelFailure::Start(format!("failed to run '{}': {}", program, err))
    }
}

/// Fail fast when the tunnel program is missing.
///
/// Runs `<program> -V`; only a missing binary is an error.
pub async fn check_tunnel_binary(program: &str) -> Result<()> {
    let status = Command::new(program)
        .arg("-V")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(VERSION_CHECK_TIMEOUT, status).await {
        Ok(Ok(status)) => {
            debug!("'{} -V' exited with {}", program, status);
            Ok(())
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(spawn_failure(program, &e).into())
        }
        Ok(Err(e)) => {
            warn!("Could not verify tunnel program '{}': {}", program, e);
            Ok(())
        }
        Err(_) => {
            warn!("'{} -V' did not finish within {:?}", program, VERSION_CHECK_TIMEOUT);
            Ok(())
        }
    }
}

/// Last N output lines, kept for error reports.
struct Diagnostics {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Diagnostics {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn render(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

struct Supervisor {
    state: watch::Sender<TunnelState>,
    scanner: Arc<LineScanner>,
    diagnostics: Diagnostics,
    url_timeout: Duration,
    grace: Duration,
}

enum Exit {
    Requested,
    TimedOut,
    Rejected,
    ProcessExited(String),
}

impl Supervisor {
    async fn run(mut self, mut child: Child, shutdown: CancellationToken) {
        let stdin = child.stdin.take();
        let mut stdout = child.stdout.take().map(BufReader::new);
        let mut stderr = child.stderr.take().map(BufReader::new);
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let mut out_skipping = false;
        let mut err_skipping = false;

        self.state.send_replace(TunnelState::AwaitingUrl);

        let deadline = tokio::time::sleep(self.url_timeout);
        tokio::pin!(deadline);

        let exit = loop {
            let awaiting = !self.is_active();

            tokio::select! {
                _ = shutdown.cancelled() => break Exit::Requested,
                _ = &mut deadline, if awaiting => break Exit::TimedOut,
                read = read_chunk(&mut stdout, &mut out_buf) => {
                    if let Some(exit) = self.on_read(read, &mut stdout, &mut out_buf, &mut out_skipping) {
                        break exit;
                    }
                }
                read = read_chunk(&mut stderr, &mut err_buf) => {
                    if let Some(exit) = self.on_read(read, &mut stderr, &mut err_buf, &mut err_skipping) {
                        break exit;
                    }
                }
                status = child.wait() => {
                    let status = match status {
                        Ok(status) => status.to_string(),
                        Err(e) => format!("unknown ({})", e),
                    };
                    if out_skipping {
                        out_buf.clear();
                    }
                    if err_skipping {
                        err_buf.clear();
                    }
                    self.drain(&mut stdout, &mut out_buf).await;
                    self.drain(&mut stderr, &mut err_buf).await;
                    break Exit::ProcessExited(status);
                }
            }
        };

        let final_state = match exit {
            Exit::Requested => {
                terminate(&mut child, self.grace).await;
                info!("Tunnel closed");
                TunnelState::Closed
            }
            Exit::TimedOut => {
                warn!("Tunnel did not report a URL within {:?}", self.url_timeout);
                terminate(&mut child, self.grace).await;
                TunnelState::Failed(TunnelFailure::Timeout {
                    after: self.url_timeout,
                    diagnostic: self.diagnostics.render(),
                })
            }
            Exit::Rejected => {
                terminate(&mut child, self.grace).await;
                TunnelState::Failed(TunnelFailure::Rejected {
                    diagnostic: self.diagnostics.render(),
                })
            }
            Exit::ProcessExited(status) => {
                warn!("Tunnel process exited: {}", status);
                TunnelState::Failed(TunnelFailure::Exited {
                    status,
                    diagnostic: self.diagnostics.render(),
                })
            }
        };

        drop(stdin);
        self.state.send_replace(final_state);
    }

    fn is_active(&self) -> bool {
        matches!(*self.state.borrow(), TunnelState::Active { .. })
    }

    /// `skipping` is set while the rest of an overlong line is discarded.
    fn on_read<R>(
        &mut self,
        read: std::io::Result<usize>,
        reader: &mut Option<R>,
        buf: &mut Vec<u8>,
        skipping: &mut bool,
    ) -> Option<Exit> {
        match read {
            Ok(0) => {
                // EOF; flush a final unterminated line
                *reader = None;
                let exit = if *skipping { None } else { self.on_line(buf) };
                *skipping = false;
                buf.clear();
                exit
            }
            Ok(_) if buf.ends_with(b"\n") => {
                let exit = if *skipping { None } else { self.on_line(buf) };
                *skipping = false;
                buf.clear();
                exit
            }
            Ok(_) => {
                if buf.len() >= MAX_LINE_BYTES {
                    if !*skipping {
                        self.on_overlong_line(buf);
                        *skipping = true;
                    }
                    buf.clear();
                }
                None
            }
            Err(e) => {
                debug!("Tunnel output stream closed: {}", e);
                *reader = None;
                buf.clear();
                None
            }
        }
    }

    fn on_line(&mut self, raw: &[u8]) -> Option<Exit> {
        let line = clean_line(raw);
        if line.is_empty() {
            return None;
        }
        self.diagnostics.push(line.clone());

        match self.scanner.scan(&line) {
            LineEvent::Url(url) if !self.is_active() => {
                info!("Tunnel established: {}", url);
                self.state.send_replace(TunnelState::Active { url });
                None
            }
            LineEvent::Fatal if !self.is_active() => {
                warn!("Tunnel rejected: {}", line);
                Some(Exit::Rejected)
            }
            LineEvent::Fatal => {
                warn!("tunnel: {}", line);
                None
            }
            _ => {
                debug!("tunnel: {}", line);
                None
            }
        }
    }

    fn on_overlong_line(&mut self, raw: &[u8]) {
        debug!("tunnel: skipping output line longer than {} bytes", MAX_LINE_BYTES);
        let preview: String = clean_line(raw)
            .chars()
            .take(OVERLONG_PREVIEW_CHARS)
            .collect();
        self.diagnostics.push(format!("{}... [line too long]", preview));
    }

    /// Collect whatever the process wrote before exiting.
    async fn drain<R: AsyncBufRead + Unpin>(&mut self, reader: &mut Option<R>, buf: &mut Vec<u8>) {
        if let Some(r) = reader.as_mut() {
            let mut limited = r.take(MAX_DRAIN_BYTES);
            let read = limited.read_to_end(buf);
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, read).await;
        }
        *reader = None;
        let rest = std::mem::take(buf);
        for line in rest.split(|b| *b == b'\n') {
            let line = clean_line(line);
            if !line.is_empty() {
                debug!("tunnel: {}", line);
                self.diagnostics.push(line);
            }
        }
    }
}

/// Read towards the next newline, never growing `buf` past
/// `MAX_LINE_BYTES`; pends forever once the stream is gone.
///
/// Partial reads stay in `buf`, so a cancelled call loses nothing.
async fn read_chunk<R: AsyncBufRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    // at least one byte, so Ok(0) still means EOF
    let limit = MAX_LINE_BYTES.saturating_sub(buf.len()).max(1) as u64;
    match reader.as_mut() {
        Some(r) => r.take(limit).read_until(b'\n', buf).await,
        None => std::future::pending().await,
    }
}

/// Ask the process to exit, then kill it after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("Tunnel process already exited: {}", status);
            return;
        }
        Ok(None) => {}
        Err(e) => warn!("Could not query tunnel process: {}", e),
    }

    send_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Tunnel process exited: {}", status),
        Ok(Err(e)) => warn!("Failed waiting for tunnel process: {}", e),
        Err(_) => {
            warn!("Tunnel process still running after {:?}; killing it", grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill tunnel process: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: pid is our own child and has not been reaped yet
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        warn!(
            "Failed to send SIGTERM to tunnel process: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop tunnel process: {}", e);
    }
}
