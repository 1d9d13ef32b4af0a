//! Status HTTP server
//!
//! Exposes the current [`StatusSnapshot`] for dashboards and scripts.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::status::{SharedStatus, StatusSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Serve the status endpoint on `addr` until the task is dropped
///
/// # Arguments
/// * `status` - Shared status state to serve
/// * `addr` - Address to listen on
///
/// # Returns
/// * `Err(ServerError)` if the listener cannot be bound or the server fails
pub async fn run_status_server(status: SharedStatus, addr: SocketAddr) -> Result<(), ServerError> {
    let app = create_status_router(status);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Status server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::new_shared_status;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_status_returns_json() {
        let status = new_shared_status();
        {
            let mut snapshot = status.write().await;
            snapshot.run_id = Some("run-42".to_string());
            snapshot.timestamp_unix_ms = 1701388800000;
            snapshot.message = "3/8 frames".to_string();
            snapshot.percent = 37.5;
            snapshot.current_file = Some("/media/frames/frame_00000004.png".to_string());
            snapshot.completed = 3;
            snapshot.total = 8;
        }

        let app = create_status_router(status.clone());

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let snapshot: StatusSnapshot =
            serde_json::from_slice(&body).expect("should deserialize to StatusSnapshot");

        assert_eq!(snapshot.run_id.as_deref(), Some("run-42"));
        assert_eq!(snapshot.percent, 37.5);
        assert_eq!(snapshot.completed, 3);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.total, 8);
    }

    #[tokio::test]
    async fn test_get_status_empty_snapshot() {
        let app = create_status_router(new_shared_status());

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let snapshot: StatusSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot, StatusSnapshot::default());
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let app = create_status_router(new_shared_status());

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
