//! Captive provisioning portal. Served only while the station hosts its
//! own access point; every HTTP request on the AP is NAT-redirected
//! here, so the root page doubles as the captive-portal landing page.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Redirect},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Notify};
use tracing::info;

use crate::connectivity::{PortalOutcome, ProvisioningPortal};
use crate::net::PORTAL_PORT;
use crate::store::ConfigStore;

const PORTAL_PAGE: &str = include_str!("../web/portal.html");

#[derive(Clone)]
struct PortalState {
    store: ConfigStore,
    submitted: Arc<AtomicBool>,
    done: Arc<Notify>,
}

#[derive(Debug, Deserialize)]
struct CredentialsForm {
    ssid: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct PriorityView {
    priority: bool,
}

pub struct ProvisioningServer {
    store: ConfigStore,
    timeout: Duration,
}

impl ProvisioningServer {
    pub fn new(store: ConfigStore, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

impl ProvisioningPortal for ProvisioningServer {
    /// Serve until credentials arrive or the window closes, whichever
    /// comes first. The listener is dropped on return so the next cycle
    /// can rebind.
    async fn run(&self) -> anyhow::Result<PortalOutcome> {
        let state = PortalState {
            store: self.store.clone(),
            submitted: Arc::new(AtomicBool::new(false)),
            done: Arc::new(Notify::new()),
        };

        let app = router(state.clone());

        let addr: SocketAddr = ([0, 0, 0, 0], PORTAL_PORT).into();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind provisioning portal at {addr}"))?;
        info!("provisioning portal listening on http://{addr}");

        let done = state.done.clone();
        let timeout = self.timeout;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = done.notified() => {}
                    _ = tokio::time::sleep(timeout) => {}
                }
            })
            .await?;

        if state.submitted.load(Ordering::SeqCst) {
            Ok(PortalOutcome::Submitted)
        } else {
            Ok(PortalOutcome::TimedOut)
        }
    }
}

fn router(state: PortalState) -> Router {
    Router::new()
        .route("/", get(handle_landing))
        // Android/iOS captive-portal detection endpoints; answering with
        // the form keeps the sign-in sheet open on the operator's phone.
        .route("/generate_204", get(handle_landing))
        .route("/hotspot-detect.html", get(handle_landing))
        .route("/configure", post(handle_configure))
        .route("/priority", get(handle_get_priority))
        .route("/priority/toggle", post(handle_toggle_priority))
        .fallback(handle_landing)
        .with_state(state)
}

async fn handle_landing() -> impl IntoResponse {
    Html(PORTAL_PAGE)
}

async fn handle_configure(
    State(state): State<PortalState>,
    Form(form): Form<CredentialsForm>,
) -> impl IntoResponse {
    if form.ssid.trim().is_empty() || form.password.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "ssid and password are required").into_response();
    }

    if let Err(err) = state.store.update_credentials(&form.ssid, &form.password).await {
        tracing::warn!("failed to persist submitted credentials: {err:#}");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to save credentials")
            .into_response();
    }

    info!(ssid = %form.ssid, "credentials received");
    state.submitted.store(true, Ordering::SeqCst);
    state.done.notify_one();
    Redirect::to("/").into_response()
}

async fn handle_get_priority(State(state): State<PortalState>) -> impl IntoResponse {
    match state.store.load().await {
        Ok(config) => Json(PriorityView {
            priority: config.network.priority,
        })
        .into_response(),
        Err(err) => {
            tracing::warn!("failed to load config for priority view: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_toggle_priority(State(state): State<PortalState>) -> impl IntoResponse {
    match state.store.toggle_priority().await {
        Ok(priority) => Json(PriorityView { priority }).into_response(),
        Err(err) => {
            tracing::warn!("failed to toggle priority flag: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
