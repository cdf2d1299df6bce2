//! JSON API handlers for session inspection

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use gridcast_core::registry::{RegistryError, SessionInfo};
use serde_json::json;

use crate::server::AppState;

/// Failures surfaced to API callers.
#[derive(Debug)]
pub enum ApiError {
    Registry(RegistryError),
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        ApiError::Registry(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Registry(error) = self;
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": error.to_string() })),
        )
            .into_response()
    }
}

pub async fn api_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    let mut sessions = state.registry.list().await?;
    sessions.sort_by_key(|session| session.created_at);
    Ok(Json(sessions))
}

pub async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use gridcast_core::config::GridcastConfig;
    use gridcast_core::encoder::{EncoderBackend, FfmpegBackend, SourceId};
    use gridcast_core::registry::Registration;
    use gridcast_core::streaming::OutputFormat;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::server::build_router;

    fn state() -> AppState {
        let backend: Arc<dyn EncoderBackend> = Arc::new(FfmpegBackend::new("ffmpeg"));
        AppState::new(GridcastConfig::for_testing(), backend)
    }

    async fn get(state: &AppState, uri: &str) -> (StatusCode, String) {
        let response = build_router(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_ok() {
        let (status, body) = get(&state(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_sessions_lists_registered_sessions() {
        let state = state();
        let (_, body) = get(&state, "/api/sessions").await;
        assert_eq!(body, "[]");

        let registration = Registration {
            session_id: Uuid::new_v4(),
            sources: vec![SourceId::new("cam1").unwrap(), SourceId::new("cam2").unwrap()],
            format: OutputFormat::Webm,
        };
        let _shutdown = state.registry.register(registration).await.unwrap();

        let (status, body) = get(&state, "/api/sessions").await;
        assert_eq!(status, StatusCode::OK);
        let sessions: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(sessions.as_array().unwrap().len(), 1);
        assert_eq!(sessions[0]["sources"], json!(["cam1", "cam2"]));
        assert_eq!(sessions[0]["format"], json!("webm"));
        assert_eq!(sessions[0]["mode"], json!("grid"));
    }
}
