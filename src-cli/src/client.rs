//! IPC client for communicating with sotto-service.

use std::time::Duration;

use sotto_common::ipc::{get_socket_path, read_json, write_json, Reply, Request};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::exit_codes::ExitCode;

/// How long to wait for the direct reply to a request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for service client operations.
#[derive(Debug, Clone)]
pub enum ServiceError {
    /// Service is not running or not connected
    NotConnected,
    /// Connection to service failed
    ConnectionFailed(String),
    /// Failed to send request
    SendFailed(String),
    /// Failed to receive reply
    ReceiveFailed(String),
    /// Service returned an error
    RemoteError(String),
    /// Request timed out
    Timeout,
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::NotConnected => write!(f, "Not connected to service"),
            ServiceError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            ServiceError::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            ServiceError::ReceiveFailed(msg) => write!(f, "Receive failed: {}", msg),
            ServiceError::RemoteError(msg) => write!(f, "Service error: {}", msg),
            ServiceError::Timeout => write!(f, "Request timed out"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl ServiceError {
    /// Convert to an appropriate exit code.
    pub fn to_exit_code(&self) -> ExitCode {
        match self {
            ServiceError::NotConnected
            | ServiceError::ConnectionFailed(_)
            | ServiceError::Timeout => ExitCode::ServiceConnectionFailed,
            ServiceError::SendFailed(_) | ServiceError::ReceiveFailed(_) => {
                ExitCode::ServiceConnectionFailed
            }
            ServiceError::RemoteError(msg) => {
                // Map the service's message to a more specific exit code
                if msg.contains("not recording") {
                    ExitCode::Success // Stop when nothing is recording is fine
                } else if msg.contains("State conflict") {
                    ExitCode::StateConflict
                } else if msg.contains("Invalid request") || msg.contains("Unrecognized") {
                    ExitCode::InvalidArguments
                } else {
                    ExitCode::GeneralError
                }
            }
        }
    }
}

/// Connection state for the service client.
enum ConnectionState {
    Disconnected,
    Connected(UnixStream),
}

/// Client for communicating with the sotto service.
pub struct ServiceClient {
    connection: Mutex<ConnectionState>,
    socket_path: std::path::PathBuf,
}

impl ServiceClient {
    /// Create a new service client.
    pub fn new() -> Self {
        Self {
            connection: Mutex::new(ConnectionState::Disconnected),
            socket_path: get_socket_path(),
        }
    }

    /// Check if the client is connected to the service.
    pub async fn is_connected(&self) -> bool {
        let conn = self.connection.lock().await;
        !matches!(*conn, ConnectionState::Disconnected)
    }

    /// Connect to the service.
    pub async fn connect(&self) -> Result<(), ServiceError> {
        let mut conn = self.connection.lock().await;

        // Already connected?
        if !matches!(*conn, ConnectionState::Disconnected) {
            return Ok(());
        }

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            ServiceError::ConnectionFailed(format!(
                "Failed to connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        *conn = ConnectionState::Connected(stream);
        Ok(())
    }

    /// Open a dedicated stream for consuming the event feed.
    pub async fn open_event_stream(&self) -> Result<UnixStream, ServiceError> {
        UnixStream::connect(&self.socket_path).await.map_err(|e| {
            ServiceError::ConnectionFailed(format!(
                "Failed to connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })
    }

    /// Send a request to the service and wait for its direct reply.
    ///
    /// The service pushes state events down the same stream. Frames that
    /// carry an event are skipped here; the first non-event frame is the
    /// reply to this request.
    pub async fn request(&self, request: Request) -> Result<Reply, ServiceError> {
        // Ensure connected
        if !self.is_connected().await {
            self.connect().await?;
        }

        let mut conn = self.connection.lock().await;
        let stream = match &mut *conn {
            ConnectionState::Connected(s) => s,
            ConnectionState::Disconnected => {
                return Err(ServiceError::NotConnected);
            }
        };

        match Self::exchange(stream, &request).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                // A timed-out or failed read may leave the stream mid-frame
                if !matches!(e, ServiceError::RemoteError(_)) {
                    *conn = ConnectionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    async fn exchange(stream: &mut UnixStream, request: &Request) -> Result<Reply, ServiceError> {
        write_json(stream, request)
            .await
            .map_err(|e| ServiceError::SendFailed(format!("Failed to write request: {}", e)))?;

        loop {
            let reply: Reply =
                match tokio::time::timeout(REQUEST_TIMEOUT, read_json(stream)).await {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(e)) => {
                        return Err(ServiceError::ReceiveFailed(format!(
                            "Failed to read reply: {}",
                            e
                        )))
                    }
                    Err(_) => return Err(ServiceError::Timeout),
                };

            // Broadcast event for some state transition; not our reply
            if reply.event_kind().is_some() {
                continue;
            }
            if reply.is_error() {
                return Err(ServiceError::RemoteError(
                    reply
                        .error
                        .unwrap_or_else(|| "unknown service error".to_string()),
                ));
            }
            return Ok(reply);
        }
    }

    /// Wait for the service to become available.
    pub async fn wait_for_service(&self, timeout: Duration) -> Result<(), ServiceError> {
        let start = std::time::Instant::now();
        let poll_interval = Duration::from_millis(100);

        while start.elapsed() < timeout {
            if self.socket_path.exists() {
                match self.connect().await {
                    Ok(()) => return Ok(()),
                    Err(_) => {
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            } else {
                tokio::time::sleep(poll_interval).await;
            }
        }

        Err(ServiceError::Timeout)
    }

    /// Ping the service.
    pub async fn ping(&self) -> Result<(), ServiceError> {
        let reply = self.request(Request::Ping).await?;
        match reply.data.as_ref().and_then(|d| d.get("pong")) {
            Some(serde_json::Value::Bool(true)) => Ok(()),
            _ => Err(ServiceError::RemoteError(
                "Unexpected ping reply".to_string(),
            )),
        }
    }

    /// Connect to the service, spawning it if necessary.
    pub async fn connect_or_spawn(&self) -> Result<(), ServiceError> {
        // First try to just connect
        if self.connect().await.is_ok() {
            return Ok(());
        }

        // Connection failed, try to spawn the service
        let service_path = Self::find_service_binary().map_err(|e| {
            ServiceError::ConnectionFailed(format!("Cannot find service binary: {}", e))
        })?;

        std::process::Command::new(&service_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| {
                ServiceError::ConnectionFailed(format!("Failed to spawn service: {}", e))
            })?;

        // Wait for service to be ready
        self.wait_for_service(Duration::from_secs(10)).await
    }

    /// Find the service binary path.
    fn find_service_binary() -> Result<std::path::PathBuf, String> {
        const SERVICE_BINARY: &str = "sotto-service";

        // 1. Sibling binary (development or bundled)
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(dir) = exe_path.parent() {
                let path = dir.join(SERVICE_BINARY);
                if path.exists() {
                    return Ok(path);
                }
            }
        }

        // 2. In PATH
        if let Ok(path) = which::which(SERVICE_BINARY) {
            return Ok(path);
        }

        // 3. Common installation paths
        let common_paths = ["/usr/bin/sotto-service", "/usr/local/bin/sotto-service"];
        for path in &common_paths {
            let path = std::path::PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        Err(format!("{} binary not found", SERVICE_BINARY))
    }
}

impl Default for ServiceClient {
    fn default() -> Self {
        Self::new()
    }
}
