//! HTTP surface: `/`, `/setup`, `/server`, `/work`, `/status`.
//!
//! Handlers run concurrently; anything touching experiment state takes the
//! coordinator lock once for its whole critical section and releases it
//! before the response body is written. Responses are JSON except the
//! plain-text index.

use crate::accounts::Account;
use crate::config::WorkerProfile;
use crate::matrix::{Cell, Mode};
use crate::state::{Coordinator, SubmitOutcome};
use axum::extract::{DefaultBodyLimit, Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Request body cap. Hex encoding doubles the artifact sizes, and the PNG
/// has no upper bound of its own, so leave generous headroom over the
/// largest acceptable capture.
pub const MAX_FORM_BYTES: usize = 64 * 1024 * 1024;

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/setup", get(setup))
        .route("/server", get(pick_server))
        .route("/work", get(get_work).post(post_work))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(MAX_FORM_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

async fn index() -> &'static str {
    "here be a measurement coordinator\n\
     Available endpoints: /setup [GET], /server [GET], /work [GET, POST], /status [GET]\n"
}

fn err(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Treat empty form/query values the same as absent ones.
fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

// =============================================================================
// /setup
// =============================================================================

#[derive(Debug, Deserialize)]
struct SetupQuery {
    id: Option<String>,
}

#[derive(serde::Serialize)]
struct SetupResponse<'a> {
    account: Account,
    visit_count: u32,
    #[serde(flatten)]
    profile: &'a WorkerProfile,
}

async fn setup(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<SetupQuery>,
) -> Response {
    let Some(id) = required(query.id) else {
        return err(StatusCode::BAD_REQUEST, "missing id");
    };

    let mut experiment = coordinator.experiment.lock().await;
    match experiment.assign_account(&id) {
        Some(account) => {
            info!("Worker {} set up with account {}", id, account.device_name);
            Json(SetupResponse {
                account,
                visit_count: coordinator.config.visits,
                profile: &coordinator.config.worker,
            })
            .into_response()
        }
        None => err(StatusCode::BAD_REQUEST, "no available accounts remain"),
    }
}

// =============================================================================
// /server and /work [GET]
// =============================================================================

#[derive(Debug, Deserialize)]
struct PairQuery {
    id: Option<String>,
    server: Option<String>,
    daita: Option<String>,
}

impl PairQuery {
    fn parts(self) -> Option<(String, String, String)> {
        Some((
            required(self.id)?,
            required(self.server)?,
            required(self.daita)?,
        ))
    }
}

async fn pick_server(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<PairQuery>,
) -> Response {
    let Some((id, server, daita)) = query.parts() else {
        return err(StatusCode::BAD_REQUEST, "missing id, server or daita");
    };
    let Ok(mode) = daita.parse::<Mode>() else {
        return err(StatusCode::BAD_REQUEST, "daita must be \"on\" or \"off\"");
    };

    let mut experiment = coordinator.experiment.lock().await;
    experiment.record_client(&id);
    match experiment.pick_pair(&server, mode) {
        Some((vpn, daita)) => Json(json!({ "vpn": vpn, "daita": daita })).into_response(),
        None => err(StatusCode::BAD_REQUEST, "no VPN configurations available"),
    }
}

async fn get_work(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<PairQuery>,
) -> Response {
    let Some((id, server, daita)) = query.parts() else {
        return err(StatusCode::BAD_REQUEST, "missing id, server or daita");
    };

    let mut experiment = coordinator.experiment.lock().await;
    experiment.record_client(&id);

    // A worker without a relay must rotate before asking for work; the
    // same status code covers an exhausted pair below, since both mean
    // "call /server, then retry".
    if server == "None" {
        return err(
            StatusCode::CONFLICT,
            "no server given, request one from /server then try again",
        );
    }
    let Ok(mode) = daita.parse::<Mode>() else {
        return err(StatusCode::BAD_REQUEST, "daita must be \"on\" or \"off\"");
    };

    match experiment.pick_url(&server, mode) {
        Some(url) => Json(json!({ "url": url, "vpn": server, "daita": mode })).into_response(),
        None => err(StatusCode::CONFLICT, "no links left to visit"),
    }
}

// =============================================================================
// /work [POST]
// =============================================================================

#[derive(Debug, Deserialize)]
struct WorkForm {
    id: Option<String>,
    url: Option<String>,
    vpn: Option<String>,
    daita: Option<String>,
    png_data: Option<String>,
    pcap_data: Option<String>,
    metadata: Option<String>,
}

async fn post_work(
    State(coordinator): State<Arc<Coordinator>>,
    Form(form): Form<WorkForm>,
) -> Response {
    let fields = (
        required(form.id),
        required(form.url),
        required(form.vpn),
        required(form.daita),
        required(form.png_data),
        required(form.pcap_data),
        required(form.metadata),
    );
    let (Some(id), Some(url), Some(vpn), Some(daita), Some(png_data), Some(pcap_data), Some(metadata)) =
        fields
    else {
        return err(StatusCode::BAD_REQUEST, "missing one or more required fields");
    };

    let Ok(mode) = daita.parse::<Mode>() else {
        return err(StatusCode::BAD_REQUEST, "daita must be \"on\" or \"off\"");
    };
    let (Ok(png), Ok(pcap)) = (hex::decode(&png_data), hex::decode(&pcap_data)) else {
        return err(StatusCode::BAD_REQUEST, "failed to decode hex-encoded data");
    };
    let Ok(metadata) = serde_json::from_str::<serde_json::Value>(&metadata) else {
        return err(StatusCode::BAD_REQUEST, "metadata is not valid JSON");
    };

    info!(
        "Received work for {} from {} ({:.1} KiB png, {:.1} KiB pcap)",
        url,
        id,
        png.len() as f64 / 1024.0,
        pcap.len() as f64 / 1024.0
    );

    // The worker already spent the visit; an unusable capture is declined
    // with 200 so the worker moves on, and the cell stays open.
    let limits = coordinator.config.limits;
    if pcap.len() < limits.min_pcap || pcap.len() > limits.max_pcap {
        warn!("Declining pcap of {} bytes for {}", pcap.len(), url);
        return Json(json!({ "status": "rejected", "reason": "pcap size out of bounds" }))
            .into_response();
    }
    if png.len() < limits.min_png {
        warn!("Declining png of {} bytes for {}", png.len(), url);
        return Json(json!({ "status": "rejected", "reason": "png too small" })).into_response();
    }

    let cell = Cell::new(vpn, mode, url);
    let mut experiment = coordinator.experiment.lock().await;
    experiment.record_client(&id);
    match experiment.submit(&cell, &png, &pcap, &metadata).await {
        Ok(SubmitOutcome::Accepted(sample)) => {
            Json(json!({ "status": "ok", "sample": sample })).into_response()
        }
        Ok(SubmitOutcome::AlreadyDone) => {
            Json(json!({ "status": "already-done" })).into_response()
        }
        Ok(SubmitOutcome::UnknownCell) => err(StatusCode::BAD_REQUEST, "unknown relay or url"),
        Err(e) => {
            error!("Failed to persist sample for {}: {}", cell, e);
            err(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist sample")
        }
    }
}

// =============================================================================
// /status
// =============================================================================

async fn status(State(coordinator): State<Arc<Coordinator>>) -> Response {
    let experiment = coordinator.experiment.lock().await;
    Json(experiment.status()).into_response()
}
