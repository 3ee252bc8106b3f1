//! IPC server with secure socket setup and peer verification.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sotto_common::ipc::{
    get_socket_path, read_frame, write_json, DecodeError, FramingError, Reply, Request,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use std::os::unix::fs::{MetadataExt, PermissionsExt};

use super::handlers::handle_request;
use super::registry::SessionRegistry;
use crate::daemon::{DaemonManager, SessionId};

/// Socket file permissions (owner read/write only)
#[cfg(unix)]
const SOCKET_MODE: u32 = 0o600;

/// Socket directory permissions (owner read/write/execute only)
#[cfg(unix)]
const DIRECTORY_MODE: u32 = 0o700;

/// Direct replies queued per session while the writer drains the socket
const REPLY_QUEUE_DEPTH: usize = 16;

/// Create the socket directory with secure permissions.
///
/// A pre-existing directory owned by another user is rejected outright:
/// whoever owns the directory can swap the socket out from under us.
#[cfg(unix)]
fn create_secure_socket_dir(socket_path: &Path) -> std::io::Result<()> {
    let socket_dir = socket_path
        .parent()
        .expect("Socket must have parent directory");

    // Create directory
    std::fs::create_dir_all(socket_dir)?;

    // Verify ownership before trusting it
    let metadata = std::fs::metadata(socket_dir)?;
    let current_uid = unsafe { libc::geteuid() };
    if metadata.uid() != current_uid {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!(
                "socket directory {} is owned by uid {}, expected {}",
                socket_dir.display(),
                metadata.uid(),
                current_uid
            ),
        ));
    }

    // Set restrictive permissions (0700)
    std::fs::set_permissions(socket_dir, std::fs::Permissions::from_mode(DIRECTORY_MODE))?;

    // Remove stale socket if exists
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    Ok(())
}

/// Set socket file permissions after binding.
#[cfg(unix)]
fn secure_socket_file(socket_path: &Path) -> std::io::Result<()> {
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

    // Verify permissions were set
    let actual = std::fs::metadata(socket_path)?.permissions().mode() & 0o777;
    if actual != SOCKET_MODE {
        warn!("Socket mode is {:o}, expected {:o}", actual, SOCKET_MODE);
    }

    Ok(())
}

/// Handle a single authenticated client connection.
///
/// The stream is split so broadcast events keep flowing while a command is
/// in flight: this task reads and dispatches frames sequentially, a writer
/// task funnels direct replies and events into the socket.
async fn handle_client<S>(
    stream: S,
    manager: Arc<DaemonManager>,
    registry: Arc<SessionRegistry>,
    session: SessionId,
    peer_info: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!("Client connected: {} (session {})", peer_info, session);

    let (mut reader, writer) = tokio::io::split(stream);
    let (reply_tx, reply_rx) = mpsc::channel::<Reply>(REPLY_QUEUE_DEPTH);
    let events = manager.subscribe();
    let writer_task = tokio::spawn(write_loop(writer, reply_rx, events, session));

    loop {
        // Read request frame
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(FramingError::ConnectionClosed) => {
                info!("Client disconnected: {} (session {})", peer_info, session);
                break;
            }
            Err(e) => {
                error!("Error reading from session {}: {}", session, e);
                break;
            }
        };

        // Decode; corruption kills the connection, an unknown command only
        // the request
        let request = match Request::decode(&frame) {
            Ok(request) => request,
            Err(e @ DecodeError::Malformed(_)) => {
                warn!("Closing session {}: {}", session, e);
                let reply = Reply::error(e.to_string(), manager.status().await);
                let _ = reply_tx.send(reply).await;
                break;
            }
            Err(e @ DecodeError::Unrecognized(_)) => {
                warn!("Rejected request from session {}: {}", session, e);
                let reply = Reply::error(e.to_string(), manager.status().await);
                if reply_tx.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
        };

        // Handle request and queue the reply
        let reply = handle_request(&manager, &registry, session, request).await;
        if reply_tx.send(reply).await.is_err() {
            break;
        }
    }

    // Closing the reply channel lets the writer drain and exit
    drop(reply_tx);
    let _ = writer_task.await;

    if let Some(info) = registry.remove(session).await {
        debug!(
            "Session {} (uid {}) closed after {:?}",
            info.id,
            info.peer.uid,
            info.connected_at.elapsed()
        );
    }
    manager.session_closed(session).await;
}

/// Funnel direct replies and broadcast events into one socket.
///
/// A client that stops draining its socket eventually lags the broadcast
/// channel; its oldest undelivered events are dropped and the stream
/// resumes. A failed write ends the session.
async fn write_loop<W>(
    mut writer: W,
    mut replies: mpsc::Receiver<Reply>,
    mut events: broadcast::Receiver<Reply>,
    session: SessionId,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            reply = replies.recv() => {
                match reply {
                    Some(reply) => {
                        if let Err(e) = write_json(&mut writer, &reply).await {
                            debug!("Write failed for session {}: {}", session, e);
                            break;
                        }
                    }
                    // Reader task is done with this connection
                    None => break,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Err(e) = write_json(&mut writer, &event).await {
                            debug!("Write failed for session {}: {}", session, e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Session {} lagging, dropped {} event(s)", session, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Run the IPC server (Unix implementation).
#[cfg(unix)]
pub async fn run_server(
    manager: Arc<DaemonManager>,
    registry: Arc<SessionRegistry>,
) -> Result<(), Box<dyn std::error::Error>> {
    use sotto_common::security::peer_verify::verify_peer;
    use tokio::net::UnixListener;

    let socket_path = get_socket_path();
    info!("Starting IPC server at {:?}", socket_path);

    // Create secure socket directory
    create_secure_socket_dir(&socket_path)?;

    // Bind socket
    let listener = UnixListener::bind(&socket_path)?;

    // Set socket permissions AFTER binding
    secure_socket_file(&socket_path)?;

    info!("IPC server listening on {:?}", socket_path);

    loop {
        // Check for shutdown before accepting new connections
        if crate::is_shutdown_requested() {
            info!("Shutdown requested, stopping IPC server");
            break;
        }

        // Use select to allow checking shutdown flag periodically
        let accept_result = tokio::select! {
            result = listener.accept() => Some(result),
            _ = tokio::time::sleep(Duration::from_millis(100)) => None,
        };

        let (stream, _) = match accept_result {
            Some(Ok(conn)) => conn,
            Some(Err(e)) => {
                error!("Accept error: {}", e);
                continue;
            }
            None => {
                // Timeout, check shutdown flag and continue
                continue;
            }
        };

        // Verify peer BEFORE any request processing
        match verify_peer(&stream) {
            Ok(peer) => {
                let session = registry.register(peer).await;
                let peer_info = match peer.pid {
                    Some(pid) => format!("uid={} pid={}", peer.uid, pid),
                    None => format!("uid={}", peer.uid),
                };
                tokio::spawn(handle_client(
                    stream,
                    Arc::clone(&manager),
                    Arc::clone(&registry),
                    session,
                    peer_info,
                ));
            }
            Err(e) => {
                warn!("Rejected connection: {}", e);
                // Connection dropped - stream goes out of scope
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::mock::MockSet;
    use sotto_common::ipc::{read_json, write_frame};
    use sotto_common::security::peer_verify::PeerCred;
    use sotto_common::Phase;
    use tokio::io::AsyncRead;

    fn test_manager() -> Arc<DaemonManager> {
        DaemonManager::new(MockSet::new().into_factory(), &Config::default()).unwrap()
    }

    fn peer() -> PeerCred {
        PeerCred {
            uid: 1000,
            pid: None,
        }
    }

    /// Connect a duplex client to a fresh handle_client task.
    async fn connect(
        manager: &Arc<DaemonManager>,
        registry: &Arc<SessionRegistry>,
    ) -> tokio::io::DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session = registry.register(peer()).await;
        tokio::spawn(handle_client(
            server,
            Arc::clone(manager),
            Arc::clone(registry),
            session,
            "test".to_string(),
        ));
        client
    }

    /// Read frames until a direct reply arrives, skipping broadcast events.
    async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Reply {
        loop {
            let reply: Reply = tokio::time::timeout(Duration::from_secs(2), read_json(reader))
                .await
                .expect("timed out waiting for reply")
                .expect("connection closed while waiting for reply");
            if reply.event_kind().is_none() {
                return reply;
            }
        }
    }

    /// Read frames until an event of the given kind arrives.
    async fn read_event<R: AsyncRead + Unpin>(reader: &mut R, kind: &str) -> Reply {
        loop {
            let reply: Reply = tokio::time::timeout(Duration::from_secs(2), read_json(reader))
                .await
                .expect("timed out waiting for event")
                .expect("connection closed while waiting for event");
            if reply.event_kind() == Some(kind) {
                return reply;
            }
        }
    }

    #[tokio::test]
    async fn test_request_reply_over_stream() {
        let manager = test_manager();
        let registry = Arc::new(SessionRegistry::new());
        let (mut reader, mut writer) =
            tokio::io::split(connect(&manager, &registry).await);

        write_json(&mut writer, &Request::Ping).await.unwrap();
        let reply = read_reply(&mut reader).await;
        assert!(!reply.is_error());
        assert_eq!(reply.data.as_ref().unwrap()["pong"], true);
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_connection_alive() {
        let manager = test_manager();
        let registry = Arc::new(SessionRegistry::new());
        let (mut reader, mut writer) =
            tokio::io::split(connect(&manager, &registry).await);

        write_frame(&mut writer, br#"{"command": "EJECT_DISC"}"#)
            .await
            .unwrap();
        let reply = read_reply(&mut reader).await;
        assert!(reply.is_error());

        // The same connection still serves valid requests
        write_json(&mut writer, &Request::Ping).await.unwrap();
        let reply = read_reply(&mut reader).await;
        assert!(!reply.is_error());
    }

    #[tokio::test]
    async fn test_malformed_payload_closes_connection() {
        let manager = test_manager();
        let registry = Arc::new(SessionRegistry::new());
        let (mut reader, mut writer) =
            tokio::io::split(connect(&manager, &registry).await);

        write_frame(&mut writer, b"\x00\x01 not json").await.unwrap();
        let reply = read_reply(&mut reader).await;
        assert!(reply.is_error());

        // Then the server hangs up
        let next = read_frame(&mut reader).await;
        assert!(matches!(next, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_events_reach_every_connected_client() {
        let manager = test_manager();
        let registry = Arc::new(SessionRegistry::new());
        let (mut reader_a, mut writer_a) =
            tokio::io::split(connect(&manager, &registry).await);
        let (mut reader_b, mut writer_b) =
            tokio::io::split(connect(&manager, &registry).await);

        // A ping round-trip proves B's session is subscribed before the
        // transition fires
        write_json(&mut writer_b, &Request::Ping).await.unwrap();
        read_reply(&mut reader_b).await;

        write_json(&mut writer_a, &Request::StartRecording)
            .await
            .unwrap();

        let reply = read_reply(&mut reader_a).await;
        assert_eq!(reply.state.phase, Phase::Recording);

        // The passive observer sees the same transition as an event
        let event = read_event(&mut reader_b, "recording_started").await;
        assert_eq!(event.state.phase, Phase::Recording);
        assert_eq!(event.sequence(), reply.state.sequence);
    }

    #[tokio::test]
    async fn test_disconnect_clears_recording_owner() {
        let manager = test_manager();
        let registry = Arc::new(SessionRegistry::new());
        let client = connect(&manager, &registry).await;
        let (mut reader, mut writer) = tokio::io::split(client);

        write_json(&mut writer, &Request::StartRecording)
            .await
            .unwrap();
        let reply = read_reply(&mut reader).await;
        assert!(!reply.is_error());
        assert!(manager.describe().await.owner.is_some());

        // Hang up mid-recording
        drop(reader);
        drop(writer);

        for _ in 0..200 {
            if manager.describe().await.owner.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = manager.describe().await;
        assert_eq!(status.owner, None);
        // The recording itself keeps running
        assert_eq!(status.snapshot.phase, Phase::Recording);
        assert_eq!(registry.count().await, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_socket_dir_created_with_restrictive_mode() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("sotto").join("sotto.sock");

        create_secure_socket_dir(&socket_path).unwrap();

        let mode = std::fs::metadata(socket_path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, DIRECTORY_MODE);
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_socket_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("sotto").join("sotto.sock");
        std::fs::create_dir_all(socket_path.parent().unwrap()).unwrap();
        std::fs::write(&socket_path, b"stale").unwrap();

        create_secure_socket_dir(&socket_path).unwrap();
        assert!(!socket_path.exists());
    }
}
