//! HTTP ingress: `POST /` accepts an optimization request, either as plain
//! JSON or as a machine-id-encrypted payload. Duplicate pids are acknowledged
//! without re-processing.

use crate::auth;
use crate::optimizer::OptimizationHandler;
use crate::request::OptimizationRequest;
use crate::state::AppState;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tracing::{debug, warn};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(handle_request))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

fn resolve_user_id(request: &mut OptimizationRequest) {
    if let Some(user_name) = request.user_name.as_deref() {
        request.user_id = nix::unistd::User::from_name(user_name)
            .ok()
            .flatten()
            .map(|user| user.uid.as_raw());
    }
}

async fn handle_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let encrypted_payload = content_type.starts_with("application/x-www-form-urlencoded");

    let json = if state.config.encrypted_requests || encrypted_payload {
        let decrypted = state
            .machine_key
            .as_ref()
            .and_then(|key| auth::decrypt(&body, key));
        match decrypted {
            Some(json) => json,
            None => {
                warn!("unauthorized request: payload could not be decrypted");
                return StatusCode::UNAUTHORIZED;
            }
        }
    } else {
        body
    };

    let mut request: OptimizationRequest = match serde_json::from_str(&json) {
        Ok(request) => request,
        Err(e) => {
            warn!("malformed optimization request: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    resolve_user_id(&mut request);
    if !request.is_valid() {
        warn!("invalid optimization request received");
        return StatusCode::BAD_REQUEST;
    }

    let pid = match request.pid {
        Some(pid) => pid,
        None => return StatusCode::BAD_REQUEST,
    };
    if state.queue.contains(pid).await {
        debug!("process {pid} is already being optimized");
        return StatusCode::OK;
    }
    state.queue.add_pid(pid).await;

    let handler = OptimizationHandler::new(state.clone());
    tokio::spawn(async move {
        handler.handle(request).await;
    });
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(encrypted: bool, key: Option<[u8; 32]>) -> AppState {
        let config = AgentConfig {
            encrypted_requests: encrypted,
            ..Default::default()
        };
        AppState::new(config, key)
    }

    fn valid_body() -> String {
        let user_name = nix::unistd::User::from_uid(nix::unistd::Uid::current())
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_else(|| "root".to_string());
        format!(
            "{{\"pid\": {}, \"command\": \"/usr/bin/app\", \"user_name\": \"{user_name}\"}}",
            std::process::id()
        )
    }

    async fn send(router: Router, content_type: &str, body: String) -> StatusCode {
        let response = router
            .oneshot(
                Request::post("/")
                    .header(header::CONTENT_TYPE, content_type)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn plain_json_request_is_accepted() {
        let router = router(test_state(false, None));
        let status = send(router, "application/json", valid_body()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let router = router(test_state(false, None));
        let status = send(router, "application/json", "{not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected() {
        let router = router(test_state(false, None));
        let status = send(router, "application/json", "{\"pid\": -2}".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn encrypted_daemon_refuses_plaintext() {
        let key = auth::derive_key("machine");
        let router = router(test_state(true, Some(key)));
        let status = send(router, "application/json", valid_body()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn encrypted_payload_round_trips() {
        let key = auth::derive_key("machine");
        let router = router(test_state(true, Some(key)));
        let sealed = auth::encrypt(&valid_body(), &key).unwrap();
        let status = send(router, "application/x-www-form-urlencoded", sealed).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn duplicate_pid_is_suppressed() {
        let state = test_state(false, None);
        state.queue.add_pid(std::process::id() as i32).await;
        let router = router(state);
        let status = send(router, "application/json", valid_body()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn healthz_answers() {
        let router = router(test_state(false, None));
        let response = router
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
