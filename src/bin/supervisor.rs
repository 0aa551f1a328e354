//! Wrapper executable (§6.1): `supervisor --server-id=<opaque>
//! --pipe=<endpoint-name> --config=<absolute-path>`.

use std::time::Duration;

use supervisor_core::config::{ServerConfig, WrapperOptions};
use supervisor_core::lifecycle::LifecycleState;
use tokio_util::sync::CancellationToken;

/// §5 "Timeouts: pipe connect 30 s".
const PIPE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let opts = match WrapperOptions::parse(std::env::args().skip(1)) {
        Ok(opts) => opts,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{}", WrapperOptions::USAGE);
            return std::process::ExitCode::FAILURE;
        }
    };

    tracing::info!(server_id = %opts.server_id, "supervisor starting");

    let config = match ServerConfig::load(&opts.config_path).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("config load failed: {e}");
            eprintln!("fatal: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let connection = match connect(&opts.pipe_name).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::error!("failed to connect IPC endpoint {}: {e}", opts.pipe_name);
            eprintln!("fatal: failed to connect to {}: {e}", opts.pipe_name);
            return std::process::ExitCode::FAILURE;
        }
    };

    let cancellation = CancellationToken::new();
    let signal_cancellation = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("termination signal received, requesting graceful stop");
            signal_cancellation.cancel();
        }
    });

    let final_state = supervisor_core::supervisor::run(connection, opts.server_id, config, cancellation).await;

    tracing::info!(?final_state, "supervisor exiting");
    match final_state {
        LifecycleState::Stopped => std::process::ExitCode::SUCCESS,
        _ => std::process::ExitCode::FAILURE,
    }
}

#[cfg(unix)]
async fn connect(pipe_name: &str) -> std::io::Result<tokio::net::UnixStream> {
    tokio::time::timeout(PIPE_CONNECT_TIMEOUT, tokio::net::UnixStream::connect(pipe_name))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "pipe connect timed out"))?
}

#[cfg(windows)]
async fn connect(pipe_name: &str) -> std::io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    tokio::time::timeout(PIPE_CONNECT_TIMEOUT, async {
        tokio::net::windows::named_pipe::ClientOptions::new().open(pipe_name)
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "pipe connect timed out"))?
}
