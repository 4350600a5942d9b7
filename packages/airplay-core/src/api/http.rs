//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to [`SpeakerService`](crate::services::SpeakerService)
//! for business logic.

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::airplay::types::{GroupOp, MediaRef, SpeakerId, TransportAction};
use crate::api::response::{api_accepted, api_ok, api_success};
use crate::api::AppState;
use crate::error::{SpeakerError, SpeakerResult};
use crate::protocol_constants::SERVICE_ID;
use crate::services::{PairingProgress, SpeakerCommand, VolumeStep};

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct VolumeRequest {
    volume: f32,
}

#[derive(Deserialize)]
struct VolumeStepRequest {
    direction: VolumeStep,
}

#[derive(Deserialize)]
struct MuteRequest {
    muted: bool,
}

#[derive(Deserialize)]
struct TransportRequest {
    action: TransportAction,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum GroupOpKind {
    Join,
    Leave,
    Set,
}

#[derive(Deserialize)]
struct GroupRequest {
    op: GroupOpKind,
    #[serde(default)]
    members: Vec<SpeakerId>,
}

#[derive(Deserialize)]
struct PinRequest {
    pin: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/speakers", get(list_speakers))
        .route(
            "/api/speakers/{id}",
            get(get_speaker).delete(remove_speaker),
        )
        .route("/api/speakers/{id}/restart", post(restart_speaker))
        .route("/api/speakers/{id}/volume", post(set_volume))
        .route("/api/speakers/{id}/volume/step", post(step_volume))
        .route("/api/speakers/{id}/mute", post(set_mute))
        .route("/api/speakers/{id}/play", post(play_media))
        .route("/api/speakers/{id}/transport", post(transport))
        .route("/api/speakers/{id}/group", post(group))
        .route(
            "/api/speakers/{id}/pairing",
            get(pairing_status).post(begin_pairing),
        )
        .route("/api/speakers/{id}/pairing/pin", post(submit_pin))
        .route("/api/bridge", get(bridge_status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn parse_id(raw: &str) -> SpeakerResult<SpeakerId> {
    SpeakerId::parse(raw)
        .ok_or_else(|| SpeakerError::InvalidArgument(format!("invalid speaker id: {raw}")))
}

async fn run_command(state: &AppState, raw: &str, command: SpeakerCommand) -> SpeakerResult<Response> {
    let id = parse_id(raw)?;
    let name = command.name();
    state.speaker_service.dispatch(&id, command).await?;
    Ok(api_success(json!({ "speakerId": id, "command": name })))
}

/// Renders pairing progress without ever exposing the credential.
fn progress_json(id: &SpeakerId, progress: &PairingProgress) -> Value {
    match progress {
        PairingProgress::PinRequested(step) => json!({
            "speakerId": id,
            "status": "pinRequested",
            "step": step.number(),
        }),
        PairingProgress::Retry {
            step,
            attempts_left,
        } => json!({
            "speakerId": id,
            "status": "wrongPin",
            "step": step.number(),
            "attemptsLeft": attempts_left,
        }),
        PairingProgress::Completed(_) => json!({
            "speakerId": id,
            "status": "paired",
        }),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness check.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    api_success(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "speakers": state.speaker_service.speakers().len(),
        "pollIntervalSecs": state.config.poll_interval_secs,
    }))
}

async fn list_speakers(State(state): State<AppState>) -> impl IntoResponse {
    api_success(state.speaker_service.speakers())
}

async fn get_speaker(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> SpeakerResult<Response> {
    let id = parse_id(&id)?;
    Ok(api_success(state.speaker_service.speaker(&id)?))
}

/// Stops the speaker's session and forgets it until it is announced again.
async fn remove_speaker(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> SpeakerResult<Response> {
    let id = parse_id(&id)?;
    state.speaker_service.remove(&id).await?;
    Ok(api_ok())
}

/// Starts a fresh supervisor, clearing a permanent failure.
async fn restart_speaker(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> SpeakerResult<Response> {
    let id = parse_id(&id)?;
    state.speaker_service.restart(&id).await?;
    Ok(api_accepted(json!({ "speakerId": id })))
}

async fn set_volume(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<VolumeRequest>,
) -> SpeakerResult<Response> {
    run_command(&state, &id, SpeakerCommand::SetVolume(payload.volume)).await
}

async fn step_volume(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<VolumeStepRequest>,
) -> SpeakerResult<Response> {
    run_command(&state, &id, SpeakerCommand::StepVolume(payload.direction)).await
}

async fn set_mute(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<MuteRequest>,
) -> SpeakerResult<Response> {
    run_command(&state, &id, SpeakerCommand::SetMute(payload.muted)).await
}

async fn play_media(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(media): Json<MediaRef>,
) -> SpeakerResult<Response> {
    run_command(&state, &id, SpeakerCommand::PlayMedia(media)).await
}

/// Play/pause/stop/next/previous. Only speakers served by the group leader
/// support these.
async fn transport(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<TransportRequest>,
) -> SpeakerResult<Response> {
    run_command(&state, &id, SpeakerCommand::Transport(payload.action)).await
}

async fn group(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<GroupRequest>,
) -> SpeakerResult<Response> {
    let id = parse_id(&id)?;
    let op = match payload.op {
        GroupOpKind::Join => GroupOp::Join,
        GroupOpKind::Leave => GroupOp::Leave,
        GroupOpKind::Set => GroupOp::Set(payload.members),
    };
    state.speaker_service.group(&id, op).await?;
    Ok(api_ok())
}

/// Begins (or restarts) HAP pairing; the device displays a PIN.
async fn begin_pairing(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> SpeakerResult<Response> {
    let id = parse_id(&id)?;
    let progress = state.speaker_service.begin_pairing(&id).await?;
    Ok(api_success(progress_json(&id, &progress)))
}

async fn pairing_status(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> SpeakerResult<Response> {
    let id = parse_id(&id)?;
    Ok(api_success(state.speaker_service.pairing_status(&id).await?))
}

async fn submit_pin(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<PinRequest>,
) -> SpeakerResult<Response> {
    let id = parse_id(&id)?;
    let progress = state.speaker_service.submit_pin(&id, &payload.pin).await?;
    Ok(api_success(progress_json(&id, &progress)))
}

async fn bridge_status(State(state): State<AppState>) -> impl IntoResponse {
    api_success(state.speaker_service.bridge_status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    use crate::airplay::types::{PairingCredential, PairingStep, ProtocolVersion};
    use crate::bootstrap::{bootstrap_services_with, BootstrappedServices};
    use crate::credentials::MemoryCredentialStore;
    use crate::runtime::TokioSpawner;
    use crate::services::SessionPhase;
    use crate::state::Config;
    use crate::test_fixtures::{airplay_record, sid, Call, FakeBackend};

    const KITCHEN: &str = "AA:BB:CC:DD:EE:01";

    async fn services(backend: Arc<FakeBackend>) -> BootstrappedServices {
        let config = Config {
            discovery_mdns: false,
            ..Config::default()
        };
        bootstrap_services_with(
            &config,
            backend,
            Arc::new(MemoryCredentialStore::new()),
            None,
            TokioSpawner::current(),
        )
        .unwrap()
    }

    /// Announces a legacy speaker and waits for its session to run.
    async fn running_speaker(services: &BootstrappedServices) {
        services
            .speaker_service
            .handle_announcement(airplay_record(KITCHEN, "Kitchen", ProtocolVersion::AirPlay1))
            .await;
        let mut status = services
            .speaker_service
            .supervisor()
            .subscribe(&sid(KITCHEN))
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.phase == SessionPhase::Running),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn call(
        services: &BootstrappedServices,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = create_router(AppState::new(services))
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_service_id() {
        let services = services(FakeBackend::new()).await;
        let (status, body) = call(&services, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["service"], SERVICE_ID);
        assert_eq!(body["data"]["speakers"], 0);
    }

    #[tokio::test]
    async fn announced_speaker_is_listed_and_fetchable() {
        let services = services(FakeBackend::new()).await;
        running_speaker(&services).await;

        let (status, body) = call(&services, Method::GET, "/api/speakers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let uri = format!("/api/speakers/{}", KITCHEN);
        let (status, body) = call(&services, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["bridged"], false);

        services.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_rejected() {
        let services = services(FakeBackend::new()).await;

        let (status, body) = call(&services, Method::GET, "/api/speakers/AA:BB", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "speaker_not_found");

        let (status, body) = call(&services, Method::GET, "/api/speakers/kitchen", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_argument");
    }

    #[tokio::test]
    async fn volume_is_validated_then_forwarded() {
        let backend = FakeBackend::new();
        let services = services(backend.clone()).await;
        running_speaker(&services).await;
        let uri = format!("/api/speakers/{}/volume", KITCHEN);

        let (status, body) =
            call(&services, Method::POST, &uri, Some(json!({ "volume": 1.5 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_argument");
        assert!(backend.commands().is_empty());

        let (status, body) =
            call(&services, Method::POST, &uri, Some(json!({ "volume": 0.25 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["command"], "set_volume");
        assert_eq!(
            backend.commands(),
            vec![Call::SetVolume(sid(KITCHEN), 0.25)]
        );

        services.shutdown().await;
    }

    #[tokio::test]
    async fn transport_without_group_leader_is_unsupported() {
        let services = services(FakeBackend::new()).await;
        running_speaker(&services).await;

        let uri = format!("/api/speakers/{}/transport", KITCHEN);
        let (status, body) =
            call(&services, Method::POST, &uri, Some(json!({ "action": "pause" }))).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["error"], "unsupported");

        services.shutdown().await;
    }

    #[tokio::test]
    async fn legacy_speaker_refuses_pairing() {
        let services = services(FakeBackend::new()).await;
        running_speaker(&services).await;

        let uri = format!("/api/speakers/{}/pairing", KITCHEN);
        let (status, _) = call(&services, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);

        services.shutdown().await;
    }

    #[tokio::test]
    async fn removal_then_second_removal_is_not_found() {
        let services = services(FakeBackend::new()).await;
        running_speaker(&services).await;

        let uri = format!("/api/speakers/{}", KITCHEN);
        let (status, body) = call(&services, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = call(&services, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn pairing_progress_never_exposes_the_credential() {
        let id = sid(KITCHEN);
        let body = progress_json(
            &id,
            &PairingProgress::Completed(PairingCredential::new("secret")),
        );
        assert_eq!(body["status"], "paired");
        assert!(!body.to_string().contains("secret"));

        let body = progress_json(
            &id,
            &PairingProgress::Retry {
                step: PairingStep::Two,
                attempts_left: 1,
            },
        );
        assert_eq!(body["step"], 2);
        assert_eq!(body["attemptsLeft"], 1);
    }
}
