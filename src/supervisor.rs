//! Ties the Framer, Control Protocol, Process Host, and Lifecycle State
//! Machine together into the per-connection actor described in §4.5 and §5:
//! one reader task, one writer guard, two capture tasks, and an exit
//! observer, all feeding a single sequential dispatch loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::framer::{FrameReader, FrameWriter};
use crate::lifecycle::{effective_graceful_timeout, should_restart, LifecycleState, StopOutcome};
use crate::process::{ExitNotice, ManagedProcess, ProcessHost, SpawnedProcess};
use crate::protocol::{CommandKind, Message};

/// Wait imposed after a forced kill before giving up on the exit
/// notification entirely (§4.5 step 4, §5 timeouts table).
const POST_KILL_WAIT: Duration = Duration::from_secs(5);

/// Runs one supervised child for the lifetime of `transport`. Returns the
/// final `LifecycleState` so the wrapper binary can choose its exit code
/// (§6.1).
pub async fn run<T>(
    transport: T,
    server_id: String,
    config: ServerConfig,
    cancellation: CancellationToken,
) -> LifecycleState
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(transport);
    let writer = Arc::new(FrameWriter::new(write_half));
    let mut reader = FrameReader::new(read_half);

    let disposed = Arc::new(AtomicBool::new(false));
    let mut restart_count = 0u32;

    emit(&writer, Message::status(LifecycleState::Initializing, None, None, None)).await;
    emit(&writer, Message::status(LifecycleState::Starting, None, None, None)).await;

    loop {
        let mut managed = ManagedProcess::new(server_id.clone(), restart_count);
        let spawn_result = ProcessHost::spawn(&config).await;

        let (host, mut spawned) = match spawn_result {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("spawn failed for server {server_id}: {e}");
                emit(
                    &writer,
                    Message::status(LifecycleState::Failed, None, None, Some(e.to_string())),
                )
                .await;
                return LifecycleState::Failed;
            }
        };
        managed.os_pid = Some(spawned.pid);

        emit(
            &writer,
            Message::status(LifecycleState::Running, Some(spawned.pid), None, None),
        )
        .await;

        let outcome = drive_connection(
            &mut reader,
            &writer,
            &host,
            &mut spawned,
            &config,
            &server_id,
            &managed,
            &cancellation,
            &disposed,
        )
        .await;

        host.dispose().await;

        match outcome {
            ConnectionOutcome::ConnectionClosed => {
                return LifecycleState::Stopped;
            }
            ConnectionOutcome::Terminal(state, stop_outcome) => {
                if should_restart(&config, stop_outcome, restart_count) {
                    emit(
                        &writer,
                        Message::status(LifecycleState::Restarting, None, None, None),
                    )
                    .await;

                    let delay = Duration::from_secs(config.restart_delay_seconds);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancellation.cancelled() => {
                            return state;
                        }
                    }

                    restart_count += 1;
                    emit(&writer, Message::status(LifecycleState::Starting, None, None, None)).await;
                    continue;
                }
                return state;
            }
        }
    }
}

enum ConnectionOutcome {
    /// The IPC connection itself closed; the child may still be running or
    /// already stopped — the caller reports `Stopped` and exits.
    ConnectionClosed,
    /// The managed child reached a terminal lifecycle state.
    Terminal(LifecycleState, Option<StopOutcome>),
}

async fn drive_connection<R>(
    reader: &mut FrameReader<R>,
    writer: &Arc<FrameWriter<impl AsyncWrite + Unpin>>,
    host: &ProcessHost,
    spawned: &mut SpawnedProcess,
    config: &ServerConfig,
    server_id: &str,
    managed: &ManagedProcess,
    cancellation: &CancellationToken,
    disposed: &Arc<AtomicBool>,
) -> ConnectionOutcome
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = cancellation.cancelled() => {
                disposed.store(true, Ordering::SeqCst);
                let state = stop_child(writer, host, spawned, config, None).await;
                return ConnectionOutcome::Terminal(state.0, Some(state.1));
            }

            changed = spawned.exit_rx.changed() => {
                if changed.is_err() {
                    continue;
                }
                let notice = spawned.exit_rx.borrow().expect("watch fired with no value");
                return ConnectionOutcome::Terminal(
                    handle_unexpected_exit(writer, notice).await,
                    None,
                );
            }

            maybe_output = spawned.output_rx.recv() => {
                if let Some(msg) = maybe_output {
                    emit(writer, msg).await;
                }
                // `None` means both capture tasks finished; keep waiting on
                // the exit notice and incoming frames.
            }

            frame = reader.read_frame() => {
                match frame {
                    Ok(Some(payload)) => {
                        if disposed.load(Ordering::SeqCst) {
                            continue;
                        }
                        let Some(message) = Message::decode(&payload) else {
                            continue;
                        };
                        if let Some(terminal) = handle_message(
                            message,
                            writer,
                            host,
                            spawned,
                            config,
                            server_id,
                            managed,
                        ).await {
                            return terminal;
                        }
                    }
                    Ok(None) => return ConnectionOutcome::ConnectionClosed,
                    Err(e) => {
                        tracing::warn!("connection-fatal framing error: {e}");
                        return ConnectionOutcome::ConnectionClosed;
                    }
                }
            }
        }
    }
}

/// Dispatch one decoded message. Returns `Some(outcome)` when the message
/// drove the lifecycle to a terminal state (Stop/Kill/Shutdown); `None`
/// otherwise, so the caller keeps looping (§4.2 "strictly sequential").
async fn handle_message(
    message: Message,
    writer: &Arc<FrameWriter<impl AsyncWrite + Unpin>>,
    host: &ProcessHost,
    spawned: &mut SpawnedProcess,
    config: &ServerConfig,
    server_id: &str,
    managed: &ManagedProcess,
) -> Option<ConnectionOutcome> {
    match message {
        Message::Command {
            command: CommandKind::GetStatus,
            correlation_id,
            ..
        } => {
            emit(
                writer,
                Message::status(LifecycleState::Running, managed.os_pid, None, None),
            )
            .await;
            if let Some(id) = correlation_id {
                emit(writer, Message::ack(id, true, None)).await;
            }
            None
        }

        Message::Command {
            command: CommandKind::Stop,
            correlation_id,
            timeout_seconds,
        } => {
            let (state, stop_outcome) =
                stop_child(writer, host, spawned, config, timeout_seconds).await;
            if let Some(id) = correlation_id {
                emit(writer, Message::ack(id, true, None)).await;
            }
            Some(ConnectionOutcome::Terminal(state, Some(stop_outcome)))
        }

        Message::Command {
            command: CommandKind::Kill,
            correlation_id,
            ..
        } => {
            let (state, stop_outcome) = force_kill(writer, host, spawned).await;
            if let Some(id) = correlation_id {
                emit(writer, Message::ack(id, true, None)).await;
            }
            Some(ConnectionOutcome::Terminal(state, Some(stop_outcome)))
        }

        Message::Input { input } => {
            if let Err(e) = host.write_stdin(&input).await {
                tracing::warn!("input message dropped: {e}");
            }
            None
        }

        Message::Heartbeat { sequence, .. } => {
            emit(writer, Message::heartbeat_echo(sequence, server_id.to_string())).await;
            None
        }

        Message::Shutdown {
            graceful_timeout_seconds,
            reason,
        } => {
            if let Some(reason) = reason {
                tracing::info!("shutdown requested: {reason}");
            }
            let (state, stop_outcome) =
                stop_child(writer, host, spawned, config, graceful_timeout_seconds).await;
            Some(ConnectionOutcome::Terminal(state, Some(stop_outcome)))
        }

        // Supervisor->Parent-only variants received from the parent are
        // simply ignored, matching §4.2's "unknown type" handling for
        // anything this direction never legitimately sends.
        Message::Status { .. } | Message::Output { .. } | Message::Ack { .. } => None,
    }
}

/// The stop algorithm (§4.5): transition to Stopping, request polite
/// termination, wait up to the effective graceful timeout, then force-kill
/// and wait up to 5s more. Exit code is read only after the child is
/// confirmed exited.
async fn stop_child(
    writer: &Arc<FrameWriter<impl AsyncWrite + Unpin>>,
    host: &ProcessHost,
    spawned: &mut SpawnedProcess,
    config: &ServerConfig,
    requested_timeout: Option<u64>,
) -> (LifecycleState, StopOutcome) {
    emit(writer, Message::status(LifecycleState::Stopping, None, None, None)).await;

    request_polite_termination(host);

    let graceful = effective_graceful_timeout(config, requested_timeout);
    if tokio::time::timeout(graceful, spawned.exit_rx.changed()).await.is_ok() {
        let notice = spawned.exit_rx.borrow().expect("watch fired with no value");
        emit(
            writer,
            Message::status(LifecycleState::Stopped, None, notice.exit_code, None),
        )
        .await;
        return (LifecycleState::Stopped, StopOutcome::GracefulExit);
    }

    force_kill(writer, host, spawned).await
}

fn request_polite_termination(host: &ProcessHost) {
    // SIGTERM to the whole group, distinct from `force_kill`'s SIGKILL: the
    // child must be able to catch this and flush world state before the
    // graceful window elapses. On Windows the job object has no catchable
    // termination primitive, so the polite step is a no-op there and the
    // forced step (kill_all) is the only one that fires.
    host.terminate_group();
}

async fn force_kill(
    writer: &Arc<FrameWriter<impl AsyncWrite + Unpin>>,
    host: &ProcessHost,
    spawned: &mut SpawnedProcess,
) -> (LifecycleState, StopOutcome) {
    host.kill_all();

    let (state, exit_code) = match tokio::time::timeout(POST_KILL_WAIT, spawned.exit_rx.changed()).await {
        Ok(Ok(())) => {
            let notice = spawned.exit_rx.borrow().expect("watch fired with no value");
            (LifecycleState::Stopped, notice.exit_code)
        }
        _ => (LifecycleState::Failed, None),
    };

    emit(writer, Message::status(state, None, exit_code, None)).await;
    (state, StopOutcome::ForcedAfterTimeout)
}

/// The child exited on its own (crash or clean exit not requested by the
/// parent). Emits the terminal status and returns it (§4.5 "Running
/// -crash-> Failed"; a zero exit code that wasn't requested is still
/// modeled as `Failed` since nothing asked for the stop).
async fn handle_unexpected_exit(
    writer: &Arc<FrameWriter<impl AsyncWrite + Unpin>>,
    notice: ExitNotice,
) -> LifecycleState {
    let state = LifecycleState::Failed;
    emit(writer, Message::status(state, None, notice.exit_code, Some("child exited unexpectedly".into()))).await;
    state
}

/// Fire-and-forget status/ack/heartbeat emission (§5, §7): a failed write
/// is logged at debug and dropped, never escalated.
async fn emit(writer: &Arc<FrameWriter<impl AsyncWrite + Unpin>>, message: Message) {
    match message.encode() {
        Ok(bytes) => {
            if let Err(e) = writer.write_frame(&bytes).await {
                tracing::debug!("failed to emit {message:?}: {e}");
            }
        }
        Err(e) => {
            tracing::debug!("failed to serialize {message:?}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use tokio::io::AsyncWriteExt;

    fn echo_config() -> ServerConfig {
        ServerConfig {
            executable_path: "/bin/cat".to_string(),
            capture_stdout: true,
            redirect_stdin: true,
            graceful_shutdown_timeout_seconds: 2,
            ..ServerConfig::default()
        }
    }

    async fn write_frame(stream: &mut (impl AsyncWrite + Unpin), message: &Message) {
        let payload = message.encode().unwrap();
        stream.write_all(&(payload.len() as u32).to_le_bytes()).await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn read_frame(stream: &mut (impl tokio::io::AsyncRead + Unpin)) -> Message {
        let mut reader = crate::framer::FrameReader::new(stream);
        let payload = reader.read_frame().await.unwrap().unwrap();
        Message::decode(&payload).unwrap()
    }

    #[tokio::test]
    async fn happy_start_then_stop_emits_spec_sequence() {
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let cancellation = CancellationToken::new();
        let config = ServerConfig {
            executable_path: "/bin/true".to_string(),
            graceful_shutdown_timeout_seconds: 5,
            ..ServerConfig::default()
        };

        let handle = tokio::spawn(run(server, "srv-1".to_string(), config, cancellation));

        let mut states = Vec::new();
        for _ in 0..2 {
            if let Message::Status { state, .. } = read_frame(&mut client).await {
                states.push(state);
            }
        }
        assert_eq!(states, vec![LifecycleState::Initializing, LifecycleState::Starting]);

        // /bin/true exits immediately; next status should be Running then
        // the unexpected-exit terminal status.
        if let Message::Status { state, .. } = read_frame(&mut client).await {
            assert_eq!(state, LifecycleState::Running);
        }

        let final_state = handle.await.unwrap();
        assert!(matches!(final_state, LifecycleState::Failed | LifecycleState::Stopped));
    }

    #[tokio::test]
    async fn correlated_stop_gets_an_ack_after_terminal_status() {
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let cancellation = CancellationToken::new();
        let config = echo_config();

        let handle = tokio::spawn(run(server, "srv-2".to_string(), config, cancellation));

        // Drain Initializing, Starting, Running.
        for _ in 0..3 {
            read_frame(&mut client).await;
        }

        write_frame(
            &mut client,
            &Message::Command {
                command: CommandKind::Stop,
                correlation_id: Some("X".to_string()),
                timeout_seconds: Some(2),
            },
        )
        .await;

        let mut saw_stopping = false;
        let mut saw_terminal = false;
        let mut saw_ack = false;
        for _ in 0..3 {
            match read_frame(&mut client).await {
                Message::Status {
                    state: LifecycleState::Stopping,
                    ..
                } => saw_stopping = true,
                Message::Status {
                    state: LifecycleState::Stopped | LifecycleState::Failed,
                    ..
                } => saw_terminal = true,
                Message::Ack {
                    acknowledged_id,
                    success,
                    ..
                } => {
                    assert_eq!(acknowledged_id, "X");
                    assert!(success);
                    saw_ack = true;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert!(saw_stopping && saw_terminal && saw_ack);

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_frame_closes_connection_without_partial_dispatch() {
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let cancellation = CancellationToken::new();
        let config = echo_config();

        let handle = tokio::spawn(run(server, "srv-3".to_string(), config, cancellation));
        for _ in 0..3 {
            read_frame(&mut client).await;
        }

        let oversize: u32 = 300_000;
        client.write_all(&oversize.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        let final_state = handle.await.unwrap();
        assert_eq!(final_state, LifecycleState::Stopped);
    }
}
