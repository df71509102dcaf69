//! Actix Web control surface: lifecycle endpoints, config, MJPEG stream,
//! uploads, health, and Prometheus metrics.
//!
//! The server runs on a dedicated thread so the pipeline hot path stays
//! free of Actix runtime concerns. Lifecycle misuse maps to 400, resource
//! acquisition failures to 500, all with structured JSON bodies.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::detect::{
    config::{LiveUpdate, StartRequest},
    data::{FramePacket, OutputQueue, SharedFrame},
    pipeline::{Orchestrator, PipelineError},
    telemetry,
};

/// File extensions accepted by the upload endpoint.
const ALLOWED_VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "avi", "mov", "mkv", "webm"];

/// Directory uploaded clips are stored under, relative to the working
/// directory.
const UPLOAD_DIR: &str = "videos";

struct ServerState {
    orchestrator: Arc<Orchestrator>,
    output: OutputQueue,
    latest: SharedFrame,
    metrics: &'static PrometheusHandle,
}

/// Handle for the API server thread.
pub struct ApiServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ApiServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the API server thread bound to `addr`.
pub fn spawn_api_server(orchestrator: Arc<Orchestrator>, addr: (String, u16)) -> Result<ApiServer> {
    let metrics = telemetry::init_metrics_recorder();
    let output = orchestrator.output_queue();
    let latest = orchestrator.latest_frame();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = telemetry::spawn_thread("vigil-api-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(ServerState {
                        orchestrator: orchestrator.clone(),
                        output: output.clone(),
                        latest: latest.clone(),
                        metrics,
                    }))
                    .route("/api/status", web::get().to(status_handler))
                    .route("/api/start", web::post().to(start_handler))
                    .route("/api/stop", web::post().to(stop_handler))
                    .route("/api/config", web::get().to(config_get_handler))
                    .route("/api/config", web::post().to(config_post_handler))
                    .route("/api/video_stream", web::get().to(video_stream_handler))
                    .route("/api/upload_video", web::post().to(upload_handler))
                    .route("/api/health", web::get().to(health_handler))
                    .route("/metrics", web::get().to(metrics_handler))
            })
            .bind(addr)?
            .run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("failed to spawn API server thread")?;
    Ok(ApiServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

fn error_response(err: &PipelineError) -> HttpResponse {
    let body = json!({ "error": err.to_string() });
    match err {
        PipelineError::AlreadyRunning | PipelineError::NotRunning => {
            HttpResponse::BadRequest().json(body)
        }
        _ => HttpResponse::InternalServerError().json(body),
    }
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.orchestrator.status())
}

/// Start a run. The body, when present, carries config overrides merged
/// over the stored config.
async fn start_handler(state: web::Data<ServerState>, body: Bytes) -> HttpResponse {
    let request: Option<StartRequest> = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => Some(request),
            Err(err) => {
                return HttpResponse::BadRequest()
                    .json(json!({ "error": format!("invalid start request: {err}") }));
            }
        }
    };

    match state.orchestrator.start(request.as_ref()) {
        Ok(config) => HttpResponse::Ok().json(json!({ "status": "started", "config": config })),
        Err(err) => error_response(&err),
    }
}

async fn stop_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.orchestrator.stop() {
        Ok(()) => HttpResponse::Ok().json(json!({ "status": "stopping" })),
        Err(err) => error_response(&err),
    }
}

async fn config_get_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.orchestrator.store().snapshot())
}

/// Apply a live update; restart-required fields are not representable in
/// the request type, so they cannot drift mid-run.
async fn config_post_handler(
    state: web::Data<ServerState>,
    update: web::Json<LiveUpdate>,
) -> HttpResponse {
    let config = state.orchestrator.store().apply_live(&update);
    info!("live config updated");
    HttpResponse::Ok().json(json!({ "status": "updated", "config": config }))
}

/// MJPEG stream. Drains the output queue; when it runs dry the last sent
/// frame is replayed at ~30 fps so clients keep a live connection across
/// stalls and between runs.
async fn video_stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut last: Option<FramePacket> = state
            .latest
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(33));
        loop {
            interval.tick().await;
            if let Some(packet) = state.output.try_pop() {
                last = Some(packet);
            }
            if let Some(packet) = &last {
                let mut payload = Vec::with_capacity(packet.jpeg.len() + 64);
                payload.extend_from_slice(b"--frame\r\n");
                payload.extend_from_slice(
                    format!("X-Sequence: {}\r\n", packet.frame_number).as_bytes(),
                );
                payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
                payload.extend_from_slice(&packet.jpeg);
                payload.extend_from_slice(b"\r\n");
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

#[derive(Deserialize)]
struct UploadQuery {
    filename: String,
}

/// Accept a raw video body and store it under the upload directory. The
/// response carries the relative path usable as `video_source`.
async fn upload_handler(query: web::Query<UploadQuery>, body: Bytes) -> HttpResponse {
    let name = match sanitize_filename(&query.filename) {
        Ok(name) => name,
        Err(reason) => {
            return HttpResponse::BadRequest().json(json!({ "error": reason }));
        }
    };
    if body.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "empty upload body" }));
    }

    let target = PathBuf::from(UPLOAD_DIR).join(&name);
    let write_result = web::block(move || -> std::io::Result<()> {
        std::fs::create_dir_all(UPLOAD_DIR)?;
        std::fs::write(&target, &body)
    })
    .await;

    match write_result {
        Ok(Ok(())) => {
            let path = format!("{UPLOAD_DIR}/{name}");
            info!("video uploaded to {path}");
            HttpResponse::Ok().json(json!({ "status": "uploaded", "path": path }))
        }
        Ok(Err(err)) => HttpResponse::InternalServerError()
            .json(json!({ "error": format!("failed to store upload: {err}") })),
        Err(err) => HttpResponse::InternalServerError()
            .json(json!({ "error": format!("failed to store upload: {err}") })),
    }
}

async fn health_handler() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn metrics_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(state.metrics.render())
}

/// Reject path traversal and unexpected extensions.
fn sanitize_filename(raw: &str) -> Result<String, String> {
    let name = Path::new(raw)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format!("invalid filename {raw:?}"))?;
    if name != raw {
        return Err(format!("invalid filename {raw:?}"));
    }
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !ALLOWED_VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        return Err(format!(
            "unsupported extension {extension:?}; allowed: {ALLOWED_VIDEO_EXTENSIONS:?}"
        ));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_accepts_plain_names() {
        assert_eq!(sanitize_filename("clip.mp4").unwrap(), "clip.mp4");
        assert_eq!(sanitize_filename("CLIP.MOV").unwrap(), "CLIP.MOV");
    }

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize_filename("../etc/passwd.mp4").is_err());
        assert!(sanitize_filename("/tmp/x.mp4").is_err());
    }

    #[test]
    fn sanitize_rejects_unknown_extensions() {
        assert!(sanitize_filename("pwn.sh").is_err());
        assert!(sanitize_filename("noext").is_err());
    }
}
