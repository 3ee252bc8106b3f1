//! IPC message framing and transport protocol.

use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum IPC frame size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Error type for wire-level framing operations.
///
/// Every variant is connection-fatal: a peer that produced one cannot be
/// trusted to stay in frame sync, so the connection is closed.
#[derive(Debug)]
pub enum FramingError {
    /// I/O error during read/write
    Io(std::io::Error),
    /// Declared or actual frame exceeds the maximum size
    FrameTooLarge { size: usize, max: usize },
    /// Payload is not valid JSON
    Parse(String),
    /// Connection closed (mid-frame or between frames)
    ConnectionClosed,
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::Io(e) => write!(f, "I/O error: {}", e),
            FramingError::FrameTooLarge { size, max } => {
                write!(f, "Frame too large: {} bytes (max {})", size, max)
            }
            FramingError::Parse(e) => write!(f, "Parse error: {}", e),
            FramingError::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for FramingError {}

impl From<std::io::Error> for FramingError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FramingError::ConnectionClosed
        } else {
            FramingError::Io(e)
        }
    }
}

/// Get the platform-specific socket path for the daemon endpoint.
pub fn get_socket_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
        PathBuf::from(runtime_dir).join("sotto").join("sotto.sock")
    }

    #[cfg(target_os = "macos")]
    {
        let tmpdir = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(tmpdir).join("sotto").join("sotto.sock")
    }
}

/// Read a length-prefixed frame with size validation.
///
/// Frame format:
/// ```text
/// ┌──────────────────┬─────────────────────────────────┐
/// │ Length (4 bytes) │ UTF-8 JSON payload (variable)   │
/// │ Big-endian       │ Max 10 MB                       │
/// └──────────────────┴─────────────────────────────────┘
/// ```
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FramingError> {
    // Read 4-byte length prefix
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    // Validate size BEFORE allocating
    if len > MAX_FRAME_SIZE {
        return Err(FramingError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    // Read payload
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    Ok(buf)
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), FramingError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(FramingError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    // Write 4-byte length prefix
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;

    // Write payload
    writer.write_all(data).await?;
    writer.flush().await?;

    Ok(())
}

/// Read and deserialize a JSON frame.
pub async fn read_json<R: AsyncRead + Unpin, T: serde::de::DeserializeOwned>(
    reader: &mut R,
) -> Result<T, FramingError> {
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).map_err(|e| FramingError::Parse(e.to_string()))
}

/// Serialize and write a JSON frame.
pub async fn write_json<W: AsyncWrite + Unpin, T: serde::Serialize>(
    writer: &mut W,
    value: &T,
) -> Result<(), FramingError> {
    let data = serde_json::to_vec(value).map_err(|e| FramingError::Parse(e.to_string()))?;
    write_frame(writer, &data).await
}
