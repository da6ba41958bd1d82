use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ircrelay::config::RelayConfig;
use ircrelay::source::{InputSpec, LineSource, SourceTarget};
use ircrelay::supervisor;

#[tokio::main]
async fn main() -> ExitCode {
    let mut config = RelayConfig::parse();

    // rustls needs an explicit provider selection.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.filter_directive().into()),
        )
        .init();

    if let Err(e) = config.resolve_auth() {
        tracing::error!(error = %e, "startup failed");
        return ExitCode::from(e.exit_code());
    }

    let target = InputSpec::parse(&config.pipe).resolve(&config.base_nick());
    if let SourceTarget::Pipe { ref path, .. } = target {
        tracing::info!(path = %path.display(), "reading lines from pipe");
    } else {
        tracing::debug!("reading lines from stdin");
    }

    let source =
        match LineSource::open(&target, config.flush_stale(), config.reconnect_wait()).await {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(error = %e, "cannot open input source");
                return ExitCode::from(e.exit_code());
            }
        };

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received, shutting down"),
                    _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("interrupt received, shutting down");
            }
        }
        watcher.cancel();
    });

    tracing::info!(
        addr = %config.addr(),
        channel = %config.channel,
        "starting ircrelay"
    );
    let reason = supervisor::run(config, target.clone(), source, cancel).await;
    tracing::info!(reason = ?reason, "exiting");

    if let SourceTarget::Pipe {
        path,
        remove_on_exit: true,
    } = &target
    {
        tracing::debug!(path = %path.display(), "removing pipe");
        let _ = std::fs::remove_file(path);
    }

    ExitCode::SUCCESS
}
