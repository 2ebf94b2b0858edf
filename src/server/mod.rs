//! HTTP signalling server.
//!
//! One endpoint matters: `POST /call/new` performs the WebRTC SDP
//! offer/answer exchange and allocates one session per peer
//! connection. `GET /healthz` answers load balancers.

pub mod rtc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::services::Services;
use crate::storage::{FsTranscriptStore, TranscriptStore};

/// Shared server state.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub services: Services,
    pub store: Arc<dyn TranscriptStore>,
    pub calls: Arc<rtc::CallRegistry>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct OfferParams {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Serialize)]
struct AnswerBody {
    sdp: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Start the signalling server.
pub async fn start(
    host: &str,
    port: u16,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load()?;
    let services = Services::from_config(&config)?;
    let store: Arc<dyn TranscriptStore> = Arc::new(FsTranscriptStore::default_store()?);

    let state = ServerState {
        config: Arc::new(config),
        services,
        store,
        calls: Arc::new(rtc::CallRegistry::new()),
    };
    let calls = Arc::clone(&state.calls);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/call/new", post(call_new))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!(%addr, "signalling server listening");

    // Dev TLS: hand the certificate pair to axum-server.
    if let (Some(cert_path), Some(key_path)) = (cert, key) {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("Failed to load certificate pair")?;
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await?;
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down, closing open calls");
            calls.close_all().await;
        })
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "OK"
}

/// Validate the offer body. Malformed JSON is 422; a well-formed body
/// that is not an offer is 400.
pub fn parse_offer(body: &str) -> Result<OfferParams, (StatusCode, &'static str)> {
    let params: OfferParams = serde_json::from_str(body)
        .map_err(|_| (StatusCode::UNPROCESSABLE_ENTITY, "body must be JSON {sdp, type}"))?;
    if params.kind != "offer" {
        return Err((StatusCode::BAD_REQUEST, "SDP type must be 'offer'"));
    }
    Ok(params)
}

async fn call_new(State(state): State<ServerState>, body: String) -> Response {
    let params = match parse_offer(&body) {
        Ok(params) => params,
        Err((status, message)) => return (status, message).into_response(),
    };

    match rtc::answer_call(&state, params.sdp).await {
        Ok(answer_sdp) => Json(AnswerBody {
            sdp: answer_sdp,
            kind: "answer".to_string(),
        })
        .into_response(),
        Err(e) => {
            error!(error = ?e, "failed to establish call");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to establish call").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_json_is_422() {
        let err = parse_offer("not json").unwrap_err();
        assert_eq!(err.0, StatusCode::UNPROCESSABLE_ENTITY);
        let err = parse_offer("{\"sdp\": 12}").unwrap_err();
        assert_eq!(err.0, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn non_offer_is_400() {
        let err = parse_offer("{\"sdp\": \"v=0\", \"type\": \"answer\"}").unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn valid_offer_parses() {
        let params = parse_offer("{\"sdp\": \"v=0\", \"type\": \"offer\"}").unwrap();
        assert_eq!(params.sdp, "v=0");
        assert_eq!(params.kind, "offer");
    }
}
