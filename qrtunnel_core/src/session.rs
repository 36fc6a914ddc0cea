//! One sharing session: local server, public tunnel, ordered teardown.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::AppEvent;
use crate::archive::ArchiveBuilder;
use crate::config::ShareConfig;
use crate::error::{Result, ShareError};
use crate::http_share::{FileServer, ShareState, create_router};
use crate::manifest::Manifest;
use crate::tunnel::{TunnelHandle, TunnelLauncher, TunnelState};

/// Everything a session needs, built by the caller before any network activity.
pub struct SessionContext {
    pub manifest: Arc<Manifest>,
    pub archive: Arc<ArchiveBuilder>,
    pub config: ShareConfig,
}

impl SessionContext {
    pub fn new(manifest: Manifest, config: ShareConfig) -> Self {
        let manifest = Arc::new(manifest);
        let archive = Arc::new(ArchiveBuilder::new(manifest.clone()));
        Self {
            manifest,
            archive,
            config,
        }
    }
}

/// Run a session until `cancel` fires or something fatal happens.
///
/// Clean interruption returns `Ok(())`. Teardown has always completed
/// by the time this returns.
pub async fn run_session(
    ctx: &SessionContext,
    launcher: &dyn TunnelLauncher,
    events: mpsc::Sender<AppEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    if ctx.manifest.is_empty() {
        return Err(ShareError::InvalidPath {
            path: Default::default(),
            reason: "no files to share".to_string(),
        });
    }

    let mut session = match Session::start(ctx, events.clone()).await {
        Ok(session) => session,
        Err(e) => {
            ctx.archive.discard();
            let _ = events.send(AppEvent::Error(e.to_string())).await;
            return Err(e);
        }
    };

    let outcome = session.run(launcher, &cancel).await;
    session.teardown().await;

    if let Err(e) = &outcome {
        let _ = events.send(AppEvent::Error(e.to_string())).await;
    }
    outcome
}

/// Bind the configured port, falling back once to an ephemeral port.
async fn bind_server(host: &str, port: u16) -> Result<FileServer> {
    match FileServer::bind(host, port).await {
        Err(ShareError::PortInUse { source, .. })
            if source.kind() == std::io::ErrorKind::AddrInUse =>
        {
            warn!("Port {} is in use, retrying with an ephemeral port", port);
            FileServer::bind(host, 0).await
        }
        other => other,
    }
}

/// Live resources of a running session.
pub struct Session {
    server: FileServer,
    tunnel: Option<TunnelHandle>,
    archive: Arc<ArchiveBuilder>,
    server_grace: Duration,
    events: mpsc::Sender<AppEvent>,
    torn_down: bool,
}

impl Session {
    /// Bind the local port and start serving.
    pub async fn start(ctx: &SessionContext, events: mpsc::Sender<AppEvent>) -> Result<Self> {
        let server_config = &ctx.config.server;
        let mut server = bind_server(&server_config.host, server_config.port).await?;

        let state = Arc::new(ShareState {
            manifest: ctx.manifest.clone(),
            archive: ctx.archive.clone(),
            archive_name: server_config.archive_name.clone(),
        });
        server.serve(create_router(state))?;

        let port = server.port();
        let _ = events.send(AppEvent::HttpServerStarted { port }).await;

        Ok(Self {
            server,
            tunnel: None,
            archive: ctx.archive.clone(),
            server_grace: Duration::from_secs(server_config.shutdown_grace_secs),
            events,
            torn_down: false,
        })
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Open the tunnel, publish its URL, then wait for the session to end.
    pub async fn run(&mut self, launcher: &dyn TunnelLauncher, cancel: &CancellationToken) -> Result<()> {
        let _ = self
            .events
            .send(AppEvent::Status("Opening public tunnel...".to_string()))
            .await;
        self.tunnel = Some(launcher.launch(self.server.port())?);
        let Some(tunnel) = self.tunnel.as_mut() else {
            return Err(ShareError::Server("tunnel handle missing".to_string()));
        };

        let settled = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Interrupted before the tunnel was ready");
                return Ok(());
            }
            _ = self.server.stopped() => return Err(server_stopped(&self.server)),
            state = tunnel.wait_settled() => state,
        };

        match settled {
            TunnelState::Active { url } => {
                info!("Sharing at {}", url);
                let _ = self.events.send(AppEvent::ShareUrlReady { url }).await;
            }
            TunnelState::Failed(failure) => return Err(failure.into()),
            other => {
                return Err(ShareError::TunnelExit {
                    status: format!("{:?}", other),
                    diagnostic: String::new(),
                });
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Interrupted, shutting down");
                Ok(())
            }
            _ = self.server.stopped() => Err(server_stopped(&self.server)),
            state = tunnel.wait_inactive() => match state {
                TunnelState::Failed(failure) => Err(failure.into()),
                other => Err(ShareError::TunnelExit {
                    status: format!("{:?}", other),
                    diagnostic: String::new(),
                }),
            },
        }
    }

    /// Stop accepting, close the tunnel, release the socket, drop the archive.
    ///
    /// Runs once; later calls return immediately.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.server.begin_shutdown();

        if let Some(tunnel) = self.tunnel.as_mut() {
            tunnel.shutdown().await;
            let _ = self.events.send(AppEvent::TunnelClosed).await;
        }

        self.server.wait_stopped(self.server_grace).await;
        self.archive.discard();
        info!("Session torn down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.torn_down {
            // dropped mid-run: stop what can be stopped synchronously
            self.server.begin_shutdown();
            self.archive.discard();
        }
    }
}

fn server_stopped(server: &FileServer) -> ShareError {
    ShareError::Server(
        server
            .failure()
            .unwrap_or_else(|| "server stopped unexpectedly".to_string()),
    )
}
