/// HTTP query surface over the mirror
///
/// Endpoints:
///   GET  /                          liveness
///   GET  /status                    refresh state, cache sizes, last cycle
///   GET  /chats                     all conversations (forces a refresh)
///   GET  /chats/:id                 message window for one conversation
///   GET  /chats/:id/last            newest message only
///   POST /chats/:id/send            body: {"text":"...","file":"/path"} or plain text
///   GET  /attachments               flat attachment table
///   GET  /attachments/:message_id   one attachment by owning message
///   GET  /file/:path                raw payload from the attachments directory
///
/// Responses use the envelope `{"ok": true, "output": ...}` or
/// `{"ok": false, "error": "..."}`.
use crate::error::{MirrorError, Result};
use crate::mirror::Mirror;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

/// Shared by every connection task
struct ApiContext {
    mirror: Arc<Mirror>,
    attachments_dir: PathBuf,
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok<T: serde::Serialize>(output: T) -> Resp {
    match serde_json::to_vec(&serde_json::json!({ "ok": true, "output": output })) {
        Ok(body) => json_resp(StatusCode::OK, body),
        Err(e) => json_err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "ok": false, "error": msg })).unwrap_or_default(),
    )
}

fn error_status(e: &MirrorError) -> StatusCode {
    match e {
        MirrorError::NotFound(_) => StatusCode::NOT_FOUND,
        MirrorError::Send(_) => StatusCode::BAD_GATEWAY,
        MirrorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        MirrorError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn mirror_err(e: &MirrorError) -> Resp {
    error!("Request failed: {}", e);
    json_err(error_status(e), &e.to_string())
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn start_messenger_api(
    mirror: Arc<Mirror>,
    addr: SocketAddr,
    attachments_dir: PathBuf,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(MirrorError::Io)?;
    serve(listener, mirror, attachments_dir, shutdown).await
}

/// Serve requests on an already bound listener until `shutdown` is set
pub async fn serve(
    listener: TcpListener,
    mirror: Arc<Mirror>,
    attachments_dir: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!("Messenger API started on http://{}", listener.local_addr()?);

    let ctx = Arc::new(ApiContext {
        mirror,
        attachments_dir,
    });
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Connection from {}", peer);
                    let io = TokioIo::new(stream);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let svc = service_fn(move |req| {
                            let ctx = ctx.clone();
                            async move { Ok::<_, Infallible>(handle(req, ctx).await) }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                            if !e.is_incomplete_message() {
                                error!("Messenger API connection error: {:?}", e);
                            }
                        }
                    });
                }
                Err(e) => error!("Messenger API accept error: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Messenger API stopped");
    Ok(())
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, ctx: Arc<ApiContext>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // CORS preflight
    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(bytes::Bytes::new()).boxed())
            .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()));
    }

    let mirror = &ctx.mirror;
    match (method.clone(), path.as_str()) {
        (Method::GET, "/") => json_ok("OK"),
        (Method::GET, "/status") => json_ok(mirror.status().await),
        (Method::GET, "/chats") => json_ok(mirror.list_conversations(true).await),
        (Method::GET, "/attachments") => json_ok(mirror.list_attachments()),
        _ => {
            // Dynamic segments
            if let Some(rest) = path.strip_prefix("/chats/") {
                let segments: Vec<&str> = rest.split('/').collect();
                return match (method, segments.as_slice()) {
                    (Method::GET, [id]) => get_messages(&decode_segment(id), mirror).await,
                    (Method::GET, [id, "last"]) => {
                        get_last_message(&decode_segment(id), mirror).await
                    }
                    (Method::POST, [id, "send"]) => {
                        post_send(req, &decode_segment(id), mirror).await
                    }
                    _ => json_err(StatusCode::NOT_FOUND, "not found"),
                };
            }
            if let Some(id) = path.strip_prefix("/attachments/") {
                if method == Method::GET {
                    return get_attachment(id, mirror).await;
                }
            }
            if let Some(rel) = path.strip_prefix("/file/") {
                if method == Method::GET {
                    return get_file(&ctx.attachments_dir, rel).await;
                }
            }
            json_err(StatusCode::NOT_FOUND, "not found")
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn get_messages(id: &str, mirror: &Mirror) -> Resp {
    match mirror.get_messages(id).await {
        Ok(messages) => json_ok(messages),
        Err(e) => mirror_err(&e),
    }
}

async fn get_last_message(id: &str, mirror: &Mirror) -> Resp {
    match mirror.get_last_message(id).await {
        Ok(message) => json_ok(message),
        Err(e) => mirror_err(&e),
    }
}

#[derive(Deserialize)]
struct SendRequest {
    #[serde(default)]
    text: String,
    file: Option<PathBuf>,
}

async fn post_send(req: Request<hyper::body::Incoming>, id: &str, mirror: &Mirror) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let request = match parse_send_body(&body) {
        Some(r) => r,
        None => return json_err(StatusCode::BAD_REQUEST, "body must be JSON or UTF-8 text"),
    };
    match mirror.send(id, &request.text, request.file).await {
        Ok(()) => json_ok("OK"),
        Err(e) => mirror_err(&e),
    }
}

async fn get_attachment(raw_id: &str, mirror: &Mirror) -> Resp {
    let message_id = match decode_segment(raw_id).parse::<i64>() {
        Ok(id) => id,
        Err(_) => return json_err(StatusCode::BAD_REQUEST, "attachment id must be a message row id"),
    };
    match mirror.get_attachment(message_id).await {
        Some(attachment) => json_ok(attachment),
        None => json_err(
            StatusCode::NOT_FOUND,
            &format!("no attachment recorded for message {}", message_id),
        ),
    }
}

async fn get_file(root: &Path, rel: &str) -> Resp {
    let Some(path) = resolve_attachment_path(root, rel) else {
        return json_err(StatusCode::BAD_REQUEST, "invalid file path");
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            cors_headers(Response::builder())
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, mime.as_ref())
                .body(Full::new(bytes::Bytes::from(bytes)).boxed())
                .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            json_err(StatusCode::NOT_FOUND, "file not found")
        }
        Err(e) => {
            error!("Reading {} failed: {}", path.display(), e);
            json_err(StatusCode::INTERNAL_SERVER_ERROR, "file read error")
        }
    }
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_body(req: Request<hyper::body::Incoming>) -> std::result::Result<bytes::Bytes, String> {
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

fn decode_segment(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// JSON `{"text", "file"}`, falling back to the whole body as text
fn parse_send_body(body: &[u8]) -> Option<SendRequest> {
    if let Ok(request) = serde_json::from_slice::<SendRequest>(body) {
        return Some(request);
    }
    let text = std::str::from_utf8(body).ok()?;
    Some(SendRequest {
        text: text.to_string(),
        file: None,
    })
}

/// Join a URL path below `root`, refusing anything that could escape it
fn resolve_attachment_path(root: &Path, raw: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(raw).ok()?;
    let rel = Path::new(decoded.as_ref());
    if rel.as_os_str().is_empty() {
        return None;
    }
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_traversal() {
        let root = Path::new("/srv/attachments");
        assert!(resolve_attachment_path(root, "../etc/passwd").is_none());
        assert!(resolve_attachment_path(root, "%2E%2E/secret").is_none());
        assert!(resolve_attachment_path(root, "/etc/passwd").is_none());
        assert!(resolve_attachment_path(root, "").is_none());
        assert_eq!(
            resolve_attachment_path(root, "ab/01/IMG%200001.jpg"),
            Some(PathBuf::from("/srv/attachments/ab/01/IMG 0001.jpg"))
        );
    }

    #[test]
    fn test_send_body_json_or_text() {
        let json = parse_send_body(br#"{"text":"hi","file":"/tmp/a.png"}"#).unwrap();
        assert_eq!(json.text, "hi");
        assert_eq!(json.file, Some(PathBuf::from("/tmp/a.png")));

        let plain = parse_send_body(b"just words").unwrap();
        assert_eq!(plain.text, "just words");
        assert!(plain.file.is_none());

        assert!(parse_send_body(&[0xff, 0xfe]).is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&MirrorError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&MirrorError::Timeout("x".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
