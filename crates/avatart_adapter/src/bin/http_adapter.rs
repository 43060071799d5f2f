#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use avatart_adapter::{
    AdapterError, AdapterHealthResponse, AdapterRuntime, CallbackAdapterResponse,
    CanUseAdapterRequest, GrantAdapterRequest, GrantAdapterResponse, GrantKeyAdapterRequest,
    GrantLimitsAdapterRequest, ReelAdapterRequest, ReelAdapterResponse,
    ReelApproveAdapterRequest, ReelRetryAdapterRequest,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type SharedRuntime = Arc<AdapterRuntime>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bind = env::var("AVATART_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;
    let runtime: SharedRuntime = Arc::new(AdapterRuntime::default_from_env()?);
    let interval_ms = runtime.monitor_poll_interval_ms();

    let runtime_for_worker = runtime.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            ticker.tick().await;
            let rt = runtime_for_worker.clone();
            match tokio::task::spawn_blocking(move || rt.run_maintenance_pass(None)).await {
                Ok(Ok(report))
                    if report.checked > 0
                        || report.redispatched > 0
                        || report.still_queued > 0
                        || report.daily_resets > 0 =>
                {
                    info!(
                        checked = report.checked,
                        completed = report.completed,
                        failed = report.failed,
                        errors = report.errors,
                        redispatched = report.redispatched,
                        still_queued = report.still_queued,
                        daily_resets = report.daily_resets,
                        monthly_resets = report.monthly_resets,
                        "maintenance pass finished"
                    );
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %err, "maintenance pass failed"),
                Err(err) => error!(error = %err, "maintenance pass panicked"),
            }
        }
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/grants", post(create_grant))
        .route("/v1/grants/pause", post(pause_grant))
        .route("/v1/grants/activate", post(activate_grant))
        .route("/v1/grants/revoke", post(revoke_grant))
        .route("/v1/grants/limits", post(update_grant_limits))
        .route("/v1/grants/can-use", post(can_use))
        .route("/v1/reels", post(submit_reel))
        .route("/v1/reels/approve", post(approve_reel))
        .route("/v1/reels/retry", post(retry_reel))
        .route("/v1/reels/resubmit", post(resubmit_reel))
        .route("/v1/provider/callback", post(provider_callback))
        .with_state(runtime);

    info!(%addr, monitor_interval_ms = interval_ms, "avatart_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_response(err: AdapterError) -> Response {
    (
        status_code(err.http_status),
        Json(serde_json::json!({
            "status": "error",
            "outcome": "REJECTED",
            "reason": err.reason,
        })),
    )
        .into_response()
}

fn grant_reply(result: Result<GrantAdapterResponse, AdapterError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => error_response(err),
    }
}

fn reel_reply(result: Result<ReelAdapterResponse, AdapterError>) -> Response {
    match result {
        Ok(body) => (status_code(body.http_status), Json(body)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn healthz(State(runtime): State<SharedRuntime>) -> (StatusCode, Json<AdapterHealthResponse>) {
    let report = runtime.health_report();
    let code = if report.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(report))
}

async fn create_grant(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<GrantAdapterRequest>,
) -> Response {
    grant_reply(runtime.grant(request))
}

async fn pause_grant(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<GrantKeyAdapterRequest>,
) -> Response {
    grant_reply(runtime.pause_grant(request))
}

async fn activate_grant(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<GrantKeyAdapterRequest>,
) -> Response {
    grant_reply(runtime.activate_grant(request))
}

async fn revoke_grant(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<GrantKeyAdapterRequest>,
) -> Response {
    grant_reply(runtime.revoke_grant(request))
}

async fn update_grant_limits(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<GrantLimitsAdapterRequest>,
) -> Response {
    grant_reply(runtime.update_grant_limits(request))
}

async fn can_use(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<CanUseAdapterRequest>,
) -> Response {
    match runtime.can_use(request) {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn submit_reel(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<ReelAdapterRequest>,
) -> Response {
    match tokio::task::spawn_blocking(move || runtime.submit_reel(request)).await {
        Ok(result) => reel_reply(result),
        Err(err) => error_response(AdapterError {
            http_status: 500,
            reason: format!("reel submission task failed: {err}"),
        }),
    }
}

async fn approve_reel(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<ReelApproveAdapterRequest>,
) -> Response {
    match tokio::task::spawn_blocking(move || runtime.approve_reel(request)).await {
        Ok(result) => reel_reply(result),
        Err(err) => error_response(AdapterError {
            http_status: 500,
            reason: format!("reel approval task failed: {err}"),
        }),
    }
}

async fn retry_reel(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<ReelRetryAdapterRequest>,
) -> Response {
    match tokio::task::spawn_blocking(move || runtime.retry_reel(request)).await {
        Ok(result) => reel_reply(result),
        Err(err) => error_response(AdapterError {
            http_status: 500,
            reason: format!("reel retry task failed: {err}"),
        }),
    }
}

async fn resubmit_reel(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<ReelRetryAdapterRequest>,
) -> Response {
    match tokio::task::spawn_blocking(move || runtime.resubmit_reel(request)).await {
        Ok(result) => reel_reply(result),
        Err(err) => error_response(AdapterError {
            http_status: 500,
            reason: format!("reel resubmission task failed: {err}"),
        }),
    }
}

async fn provider_callback(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("Signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let result: Result<CallbackAdapterResponse, AdapterError> =
        runtime.handle_provider_callback(&body, signature.as_deref(), None);
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => error_response(err),
    }
}
