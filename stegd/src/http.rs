//! The HTTP surface.
//!
//! A thin JSON layer over ingestion, the registry, the result documents,
//! and the removal policy. Handlers never block on analyzer work: upload
//! enqueues and returns, and clients poll `/status` then fetch `/result`
//! (425 until the document first materializes).

use std::{collections::BTreeSet, net::SocketAddr, path::Path as FsPath, sync::Arc};

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fingerprint::Fingerprint;
use serde_json::json;
use tracing::error;

use crate::{config, ingest, now, removal, Runtime};

/// Build the service router.
pub fn router(runtime: Arc<Runtime>) -> Router {
    // The precise size gate lives in ingestion; the body limit only needs
    // to bound hostile requests, with slack for multipart framing.
    let body_limit = runtime.settings().max_content_length() * 2 + 1024;
    Router::new()
        .route("/upload", post(upload))
        .route("/status/:submission", get(status))
        .route("/infos/:submission", get(infos))
        .route("/result/:submission", get(result))
        .route("/download/:submission/:analyzer", get(download))
        .route("/image/:name", get(image_by_name))
        .route("/image/:submission/:name", get(image_from_submission))
        .route("/remove/:submission", post(remove))
        .route("/remove_password/:submission", post(remove_password))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(runtime)
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn parse_submission(raw: &str) -> Result<Fingerprint<fingerprint::Submission>, Response> {
    raw.parse()
        .map_err(|_| error_body(StatusCode::NOT_FOUND, "Resource not found"))
}

/// The uploader's address: first hop of X-Forwarded-For when present,
/// otherwise the socket peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn upload(
    State(runtime): State<Arc<Runtime>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut bytes = None;
    let mut filename = None;
    let mut password = None;
    let mut deep = false;

    loop {
        match multipart.next_field().await {
            Ok(None) => break,
            Ok(Some(field)) => {
                let name = field.name().map(str::to_string);
                match name.as_deref() {
                    Some("image") => {
                        filename = field.file_name().map(str::to_string);
                        match field.bytes().await {
                            Ok(data) => bytes = Some(data),
                            Err(err) => return multipart_failure(&err.to_string()),
                        }
                    }
                    Some("password") => match field.text().await {
                        Ok(text) if !text.is_empty() => password = Some(text),
                        Ok(_) => {}
                        Err(err) => return multipart_failure(&err.to_string()),
                    },
                    Some("deep") => match field.text().await {
                        Ok(text) => deep = text == "true",
                        Err(err) => return multipart_failure(&err.to_string()),
                    },
                    _ => {}
                }
            }
            Err(err) => return multipart_failure(&err.to_string()),
        }
    }

    let (Some(bytes), Some(filename)) = (bytes, filename) else {
        return error_body(StatusCode::BAD_REQUEST, "No image provided");
    };

    let ip = client_ip(&headers, peer);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok());

    let outcome = ingest::ingest(
        &runtime,
        ingest::Upload {
            bytes: &bytes,
            filename: &filename,
            password: password.as_deref(),
            deep,
            client_ip: &ip,
            user_agent,
        },
    )
    .await;

    match outcome {
        Ok(print) => Json(json!({ "submission_hash": print.to_string() })).into_response(),
        Err(err @ (ingest::Error::Empty | ingest::Error::UnsupportedType)) => {
            error_body(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Err(err @ ingest::Error::TooLarge) => {
            error_body(StatusCode::PAYLOAD_TOO_LARGE, &err.to_string())
        }
        Err(err) => {
            error!(error = %err, "ingest failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Upload failed")
        }
    }
}

fn multipart_failure(message: &str) -> Response {
    if message.contains("length limit") {
        error_body(StatusCode::PAYLOAD_TOO_LARGE, "Image size exceeded")
    } else {
        error_body(StatusCode::BAD_REQUEST, "No image provided")
    }
}

async fn status(
    State(runtime): State<Arc<Runtime>>,
    Path(submission): Path<String>,
) -> Response {
    let print = match parse_submission(&submission) {
        Ok(print) => print,
        Err(response) => return response,
    };
    match runtime.registry().submission(&print) {
        Ok(Some(record)) => {
            Json(json!({ "status": record.status().to_string() })).into_response()
        }
        Ok(None) => error_body(StatusCode::NOT_FOUND, "Resource not found"),
        Err(err) => {
            error!(error = %err, "status lookup failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Lookup failed")
        }
    }
}

async fn infos(State(runtime): State<Arc<Runtime>>, Path(submission): Path<String>) -> Response {
    let print = match parse_submission(&submission) {
        Ok(print) => print,
        Err(response) => return response,
    };

    let loaded = runtime.registry().submission(&print).and_then(|record| {
        let Some(record) = record else {
            return Ok(None);
        };
        let image = runtime.registry().image(record.image())?;
        let siblings = runtime.registry().submissions_of(record.image())?;
        Ok(image.map(|image| (record, image, siblings)))
    });

    match loaded {
        Ok(Some((record, image, siblings))) => {
            let names: BTreeSet<&String> = siblings.iter().map(|s| s.filename()).collect();
            let passwords: BTreeSet<&String> =
                siblings.iter().filter_map(|s| s.password().as_ref()).collect();
            let blob_name = image
                .path()
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            Json(json!({
                "image_path": format!("image/{blob_name}"),
                "names": names,
                "size": image.size(),
                "first_submission_date": image.first_seen(),
                "last_submission_date": image.last_seen(),
                "upload_count": image.upload_count(),
                "passwords": passwords,
                "removal_min_age_seconds": runtime.settings().removal_min_age_secs(),
                "submission_date": record.created(),
            }))
            .into_response()
        }
        Ok(None) => error_body(StatusCode::NOT_FOUND, "Resource not found"),
        Err(err) => {
            error!(error = %err, "infos lookup failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Lookup failed")
        }
    }
}

async fn result(State(runtime): State<Arc<Runtime>>, Path(submission): Path<String>) -> Response {
    let print = match parse_submission(&submission) {
        Ok(print) => print,
        Err(response) => return response,
    };
    let record = match runtime.registry().submission(&print) {
        Ok(Some(record)) => record,
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "Resource not found"),
        Err(err) => {
            error!(error = %err, "result lookup failed");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "Lookup failed");
        }
    };

    let result_dir = runtime.store().submission_dir(record.image(), &print);
    match report::load(&result_dir) {
        Ok(Some(results)) => Json(json!({ "results": results })).into_response(),
        Ok(None) => error_body(
            StatusCode::from_u16(425).unwrap(),
            "Results not ready yet...",
        ),
        Err(err) => {
            error!(error = %err, "result document unreadable");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Results unreadable")
        }
    }
}

async fn download(
    State(runtime): State<Arc<Runtime>>,
    Path((submission, analyzer)): Path<(String, String)>,
) -> Response {
    let print = match parse_submission(&submission) {
        Ok(print) => print,
        Err(response) => return response,
    };
    if !config::ARCHIVE_ANALYZERS.contains(&analyzer.as_str()) {
        return error_body(StatusCode::NOT_FOUND, "Tool output not found.");
    }
    let Ok(Some(record)) = runtime.registry().submission(&print) else {
        return error_body(StatusCode::NOT_FOUND, "Tool output not found.");
    };

    let archive = runtime
        .store()
        .archive_path(record.image(), &print, &analyzer);
    match tokio::fs::read(&archive).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/x-7z-compressed".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{analyzer}.7z\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => error_body(StatusCode::NOT_FOUND, "Tool output not found."),
    }
}

async fn image_by_name(State(runtime): State<Arc<Runtime>>, Path(name): Path<String>) -> Response {
    // `<image_fp>.<ext>`: the fingerprint is everything before the dot.
    let raw_print = name.split('.').next().unwrap_or("");
    let Ok(print) = raw_print.parse::<Fingerprint<fingerprint::Image>>() else {
        return error_body(StatusCode::NOT_FOUND, "Image not found or unsupported format");
    };
    let Ok(Some(image)) = runtime.registry().image(&print) else {
        return error_body(StatusCode::NOT_FOUND, "Image not found or unsupported format");
    };
    serve_image(image.path().clone()).await
}

async fn image_from_submission(
    State(runtime): State<Arc<Runtime>>,
    Path((submission, name)): Path<(String, String)>,
) -> Response {
    let print = match parse_submission(&submission) {
        Ok(print) => print,
        Err(response) => return response,
    };
    let Ok(Some(record)) = runtime.registry().submission(&print) else {
        return error_body(StatusCode::NOT_FOUND, "Image not found or unsupported format");
    };

    // Only the final component; anything path-shaped is discarded.
    let Some(file_name) = FsPath::new(&name).file_name() else {
        return error_body(StatusCode::NOT_FOUND, "Image not found or unsupported format");
    };
    let target = runtime
        .store()
        .submission_dir(record.image(), &print)
        .join(file_name);
    serve_image(target).await
}

async fn serve_image(path: std::path::PathBuf) -> Response {
    let allowed = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| config::IMAGE_EXTENSIONS.contains(&ext.as_str()));
    if !allowed {
        return error_body(StatusCode::NOT_FOUND, "Image not found or unsupported format");
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let content_type = match path
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
                .as_deref()
            {
                Some("png") => "image/png",
                Some("jpg") | Some("jpeg") => "image/jpeg",
                Some("gif") => "image/gif",
                Some("bmp") => "image/bmp",
                Some("webp") => "image/webp",
                Some("tiff") => "image/tiff",
                _ => "application/octet-stream",
            };
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(_) => error_body(StatusCode::NOT_FOUND, "Image not found or unsupported format"),
    }
}

async fn remove(State(runtime): State<Arc<Runtime>>, Path(submission): Path<String>) -> Response {
    let print = match parse_submission(&submission) {
        Ok(print) => print,
        Err(response) => return response,
    };
    match removal::remove_image(&runtime, &print, now()) {
        Ok(()) => Json(json!({ "message": "Image successfully removed" })).into_response(),
        Err(err) => removal_failure(err),
    }
}

async fn remove_password(
    State(runtime): State<Arc<Runtime>>,
    Path(submission): Path<String>,
) -> Response {
    let print = match parse_submission(&submission) {
        Ok(print) => print,
        Err(response) => return response,
    };
    match removal::remove_password(&runtime, &print, now()) {
        Ok(()) => Json(json!({ "message": "Password successfully removed" })).into_response(),
        Err(err) => removal_failure(err),
    }
}

fn removal_failure(err: removal::Error) -> Response {
    match &err {
        removal::Error::NotFound => error_body(StatusCode::NOT_FOUND, "Resource not found"),
        removal::Error::NoPassword => error_body(StatusCode::BAD_REQUEST, &err.to_string()),
        removal::Error::MultipleUploaders { ip_count } => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": err.to_string(), "ip_count": ip_count })),
        )
            .into_response(),
        removal::Error::TooYoung { .. } => error_body(StatusCode::FORBIDDEN, &err.to_string()),
        _ => {
            error!(error = %err, "removal failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Removal failed")
        }
    }
}
