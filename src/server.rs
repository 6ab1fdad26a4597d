use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use tokio::sync::watch;

use crate::gateway::{StreamError, TranscodeGateway};
use crate::pages;

#[derive(Clone)]
struct AppState {
    gateway: Arc<TranscodeGateway>,
}

/// Landing page: one tile per camera.
async fn index(State(state): State<AppState>) -> Html<String> {
    Html(pages::index_page(state.gateway.sources()))
}

/// Viewer page for a single camera.
async fn view(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Html<String>, StatusCode> {
    let source = state.gateway.get_source(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Html(pages::view_page(&id, source)))
}

/// Camera list as JSON, for scripted consumers and the startup check.
async fn api_cameras(State(state): State<AppState>) -> impl IntoResponse {
    let cameras: Vec<serde_json::Value> = state
        .gateway
        .sources()
        .iter()
        .map(|(id, source)| {
            serde_json::json!({
                "id": id,
                "name": source.name,
                "description": source.description,
                "stream": format!("/stream/{}", id),
                "view": format!("/view/{}", id),
            })
        })
        .collect();

    let json = serde_json::json!({
        "cameras": cameras,
        "active_streams": state.gateway.active_streams(),
    });

    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        json.to_string(),
    )
}

/// Live stream: fragmented MP4 straight from the transcoder's stdout. The
/// body owns the process; when the viewer hangs up the process is reaped.
async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, StatusCode> {
    let chunks = state.gateway.open_stream(&id).map_err(|e| {
        eprintln!("[server] stream '{}' refused: {}", id, e);
        stream_error_status(&e)
    })?;

    // Never let intermediaries cache or buffer a live stream
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate",
        )
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .body(Body::from_stream(chunks))
        .unwrap())
}

fn stream_error_status(e: &StreamError) -> StatusCode {
    match e {
        StreamError::SourceNotFound(_) => StatusCode::NOT_FOUND,
        StreamError::Busy => StatusCode::SERVICE_UNAVAILABLE,
        StreamError::ProcessStartFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Run the HTTP front door until shutdown is signalled.
pub async fn run_server(
    addr: SocketAddr,
    gateway: Arc<TranscodeGateway>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = AppState { gateway };

    let app = Router::new()
        .route("/", get(index))
        .route("/view/{id}", get(view))
        .route("/stream/{id}", get(stream))
        .route("/api/cameras", get(api_cameras))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow_and_update() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_mapping() {
        assert_eq!(
            stream_error_status(&StreamError::SourceNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            stream_error_status(&StreamError::Busy),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            stream_error_status(&StreamError::ProcessStartFailed(std::io::Error::other(
                "boom"
            ))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
