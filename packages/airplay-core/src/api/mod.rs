//! HTTP control surface over [`SpeakerService`].
//!
//! Handlers only parse input and shape output; every decision is made by the
//! engine behind `AppState`.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrappedServices;
use crate::events::BroadcastEventBridge;
use crate::services::SpeakerService;
use crate::state::Config;

pub mod http;
pub mod response;

/// Failure to serve the API.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or accepting on the listener failed.
    #[error("HTTP listener failed: {0}")]
    Bind(#[from] std::io::Error),
}

/// Handles shared by every request.
#[derive(Clone)]
pub struct AppState {
    /// Engine facade.
    pub speaker_service: Arc<SpeakerService>,
    /// Event bridge, for handlers that expose the event stream.
    pub event_bridge: Arc<BroadcastEventBridge>,
    /// Engine configuration.
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(services: &BootstrappedServices) -> Self {
        Self {
            speaker_service: Arc::clone(&services.speaker_service),
            event_bridge: Arc::clone(&services.event_bridge),
            config: Arc::new(services.config.clone()),
        }
    }
}

/// Serves the HTTP API on `port` until `cancel` fires.
pub async fn start_server(
    state: AppState,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("[Server] Listening on http://{}", listener.local_addr()?);

    let app = http::create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
