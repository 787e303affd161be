//! Control protocol server.
//!
//! Accepts `POST /` with a JSON [`CniRequest`] over a root-owned Unix socket
//! (or TCP) and answers with a [`CniResponse`] or an error body.

use std::convert::Infallible;
use std::future::Future;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use hyperlocal::UnixServerExt;
use ovnk_cni_types::CniRequest;
use tracing::{debug, info, warn, Instrument};

use crate::handler::Handler;

/// Serve on a Unix socket until `shutdown` resolves.
///
/// A stale socket file is replaced; the new one is only accessible to the
/// owner.
pub async fn serve_unix(
    handler: Arc<Handler>,
    path: &Path,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if remove_socket(path)
        .with_context(|| format!("failed to remove stale socket {}", path.display()))?
    {
        debug!(socket = %path.display(), "Removed stale socket");
    }

    let builder = Server::bind_unix(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict {}", path.display()))?;

    info!(socket = %path.display(), "CNI server listening");

    let make_svc = make_service_fn(move |_| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(service_fn(move |req| route(Arc::clone(&handler), req))) }
    });

    builder
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await
        .context("CNI server failed")?;

    if let Err(e) = remove_socket(path) {
        warn!(socket = %path.display(), error = %e, "Failed to remove socket");
    }
    info!("CNI server stopped");
    Ok(())
}

/// Serve on an already bound TCP listener until `shutdown` resolves.
pub async fn serve_tcp(
    handler: Arc<Handler>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let builder = Server::from_tcp(listener).context("failed to adopt TCP listener")?;

    info!(addr = %addr, "CNI server listening");

    let make_svc = make_service_fn(move |_| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(service_fn(move |req| route(Arc::clone(&handler), req))) }
    });

    builder
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await
        .context("CNI server failed")?;

    info!("CNI server stopped");
    Ok(())
}

/// Remove a socket file; `Ok(false)` when there was none.
fn remove_socket(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

async fn route(handler: Arc<Handler>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.uri().path() != "/" {
        return Ok(text(StatusCode::NOT_FOUND, "not found".to_string()));
    }
    if req.method() != Method::POST {
        return Ok(text(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_string(),
        ));
    }

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => return Ok(text(StatusCode::BAD_REQUEST, format!("failed to read request: {e}"))),
    };
    let request: CniRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return Ok(text(StatusCode::BAD_REQUEST, format!("invalid request: {e}"))),
    };

    let command = request.env.get("CNI_COMMAND").cloned().unwrap_or_default();
    let sandbox = request.env.get("CNI_CONTAINERID").cloned().unwrap_or_default();
    let span = tracing::info_span!("cni", command = %command, sandbox = %sandbox);

    let outcome = handler.handle(request).instrument(span.clone()).await;
    let response = match outcome {
        Ok(response) => match serde_json::to_vec(&response) {
            Ok(json) => {
                span.in_scope(|| debug!("CNI request succeeded"));
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .body(Body::from(json))
                    .unwrap_or_else(|_| Response::new(Body::empty()))
            }
            Err(e) => text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode response: {e}"),
            ),
        },
        Err(e) => {
            span.in_scope(|| warn!(error = %e, "CNI request failed"));
            text(StatusCode::BAD_REQUEST, e.to_string())
        }
    };
    Ok(response)
}

fn text(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cni.sock");

        assert!(!remove_socket(&socket).unwrap());

        std::fs::write(&socket, b"").unwrap();
        assert!(remove_socket(&socket).unwrap());
        assert!(!socket.exists());

        // A directory in its place is reported, not ignored.
        std::fs::create_dir(&socket).unwrap();
        assert!(remove_socket(&socket).is_err());
    }
}
