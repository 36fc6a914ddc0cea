use anyhow::Context;
use clap::Parser;
use std::io::BufRead;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use qrtunnel_core::{
    AppEvent, Manifest, SessionContext, ShareConfig, ShareError, SshTunnelLauncher,
    check_tunnel_binary, exit_code, run_session,
};

mod cli;
mod output;
mod picker;

use cli::Args;

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> ExitCode {
    // 0. .env first so it can feed both clap and the config overrides
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(&args.log_level);

    let code = match run(args) {
        Ok(()) => exit_code::OK,
        Err(e) => {
            let code = e
                .downcast_ref::<ShareError>()
                .map(ShareError::exit_code)
                .unwrap_or(exit_code::OTHER);
            eprintln!("Error: {:#}", e);
            code
        }
    };
    ExitCode::from(code)
}

/// Logs go to stderr; stdout carries the banner and the QR code.
fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<ShareConfig> {
    let mut config = match &args.config {
        Some(path) => ShareConfig::load_from(path)?,
        None => ShareConfig::load(),
    };
    config.apply_env()?;
    args.apply_to(&mut config);
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    // 1. Resolve and validate files before any socket or process exists.
    //    The picker runs here, on the main thread, as native dialogs require.
    let paths = if args.paths.is_empty() {
        picker::pick_files()?
    } else {
        args.paths.clone()
    };
    let manifest = Manifest::build(&paths)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let result = runtime.block_on(share(manifest, config, !args.no_qr));
    // blocking work left behind must not hold the process open
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

async fn share(manifest: Manifest, config: ShareConfig, show_qr: bool) -> anyhow::Result<()> {
    check_tunnel_binary(&config.tunnel.program).await?;

    print!("{}", output::banner(&manifest));

    // 2. One token stops everything: signals and 'q' both cancel it
    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_signal(cancel.clone()));
    spawn_quit_reader(cancel.clone());

    // 3. Event channel from the session to the terminal
    let (tx_event, rx_event) = mpsc::channel::<AppEvent>(64);
    let printer = tokio::spawn(print_events(rx_event, show_qr));

    let ctx = SessionContext::new(manifest, config);
    let launcher = SshTunnelLauncher::new(ctx.config.tunnel.clone());

    let result = run_session(&ctx, &launcher, tx_event, cancel.clone()).await;

    cancel.cancel();
    let _ = printer.await;

    result?;
    println!("Sharing stopped. Goodbye!");
    Ok(())
}

async fn wait_for_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, stopping...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, stopping...");
        }
        _ = cancel.cancelled() => return,
    }

    cancel.cancel();
}

/// Watch stdin for a line reading `q`.
///
/// Runs on a plain thread: a blocking stdin read inside the runtime would
/// keep it from shutting down.
fn spawn_quit_reader(cancel: CancellationToken) {
    let spawned = thread::Builder::new()
        .name("quit-reader".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if is_quit_command(&line) {
                    tracing::info!("Quit requested, stopping...");
                    cancel.cancel();
                    break;
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
        });

    if let Err(e) = spawned {
        tracing::warn!("Could not watch stdin for 'q': {}", e);
    }
}

fn is_quit_command(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("q")
}

async fn print_events(mut rx_event: mpsc::Receiver<AppEvent>, show_qr: bool) {
    while let Some(event) = rx_event.recv().await {
        match event {
            AppEvent::Status(msg) => tracing::info!("{}", msg),
            AppEvent::HttpServerStarted { port } => {
                tracing::info!("Local file server listening on port {}", port);
            }
            AppEvent::ShareUrlReady { url } => {
                println!("\n{}", output::share_block(&url, show_qr));
            }
            AppEvent::TunnelClosed => tracing::info!("Tunnel closed"),
            // reported once by main with the exit code
            AppEvent::Error(msg) => tracing::debug!("Session error: {}", msg),
        }
    }
}
