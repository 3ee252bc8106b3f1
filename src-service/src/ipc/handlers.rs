//! IPC request handlers.
//!
//! Every request gets exactly one direct reply carrying the state snapshot
//! taken when the command was applied (or rejected). Broadcast events travel
//! separately through the manager's event channel.

use std::sync::Arc;

use serde_json::json;
use sotto_common::ipc::{Reply, Request};
use sotto_common::StateSnapshot;
use tracing::{debug, info, warn};

use crate::daemon::{DaemonManager, SessionId};
use crate::error::Result;
use crate::ipc::registry::SessionRegistry;

/// Handle a decoded request and build its direct reply.
pub async fn handle_request(
    manager: &Arc<DaemonManager>,
    registry: &SessionRegistry,
    session: SessionId,
    request: Request,
) -> Reply {
    debug!("Handling {} from session {}", request.name(), session);

    // Validate request parameters
    if let Err(e) = request.validate() {
        warn!("Invalid {} from session {}: {}", request.name(), session, e);
        return Reply::error(format!("Invalid request: {}", e), manager.status().await);
    }

    match request {
        Request::StartRecording => {
            let result = manager.start_recording(session).await;
            reply_from(manager, result).await
        }
        Request::StopRecording => {
            let result = manager.stop_recording().await;
            reply_from(manager, result).await
        }
        Request::GetStatus => {
            let status = manager.describe().await;
            let data = json!({
                "owner": status.owner,
                "transcript": status.transcript,
                "sessions": registry.count().await,
            });
            Reply::success(Some(data), status.snapshot)
        }
        Request::ProcessText { text } => {
            let result = manager.process_text(text).await;
            reply_from(manager, result).await
        }
        Request::Pause => {
            let result = manager.pause().await;
            reply_from(manager, result).await
        }
        Request::Resume => {
            let result = manager.resume().await;
            reply_from(manager, result).await
        }
        Request::Restart => {
            let result = manager.restart().await;
            reply_from(manager, result).await
        }
        Request::Shutdown => {
            info!("Shutdown requested via IPC (session {})", session);
            match manager.shutdown().await {
                Ok(snapshot) => {
                    // Trigger graceful shutdown of the accept loop
                    crate::request_shutdown();
                    Reply::success(None, snapshot)
                }
                Err(e) => Reply::error(e.to_string(), manager.status().await),
            }
        }
        Request::Ping => Reply::success(Some(json!({"pong": true})), manager.status().await),
    }
}

/// Map a manager call result onto the wire reply shape.
///
/// Rejected commands report the state they were rejected against; the
/// manager has already logged the detail.
async fn reply_from(manager: &Arc<DaemonManager>, result: Result<StateSnapshot>) -> Reply {
    match result {
        Ok(snapshot) => Reply::success(None, snapshot),
        Err(e) => Reply::error(e.to_string(), manager.status().await),
    }
}
