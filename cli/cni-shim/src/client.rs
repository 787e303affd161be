//! Control protocol client.
//!
//! Posts a [`CniRequest`] to the node CNI server over its Unix socket (or TCP)
//! and returns the server's reply. Every call opens a fresh connection.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::UnixConnector;
use ovnk_cni_types::{CniRequest, CniResponse};
use thiserror::Error;
use tracing::debug;

/// Where the CNI server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// Errors from talking to the CNI server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to marshal CNI request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to build CNI request: {0}")]
    Request(#[from] hyper::http::Error),

    /// The server is not reachable.
    #[error("failed to connect to CNI server at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: hyper::Error,
    },

    #[error("failed to send CNI request: {0}")]
    Send(#[source] hyper::Error),

    #[error("failed to read CNI result: {0}")]
    ReadBody(#[source] hyper::Error),

    /// The server answered but rejected the request.
    #[error("CNI request failed with status {status}: '{body}'")]
    Status { status: u16, body: String },

    #[error("failed to unmarshal response '{body}': {source}")]
    Decode {
        body: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientError {
    /// Whether the server could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

/// Client for the node CNI server.
#[derive(Debug, Clone)]
pub struct ServerClient {
    endpoint: Endpoint,
}

impl ServerClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send a request and return the raw response body on HTTP 200.
    pub async fn post(&self, request: &CniRequest) -> Result<Vec<u8>, ClientError> {
        let body = serde_json::to_vec(request).map_err(ClientError::Encode)?;
        debug!(endpoint = %self.endpoint, bytes = body.len(), "Sending CNI request");

        let response = self.send(body).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(ClientError::ReadBody)?;

        if status != StatusCode::OK {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        Ok(bytes.to_vec())
    }

    /// Send a request and decode the server's reply.
    pub async fn call(&self, request: &CniRequest) -> Result<CniResponse, ClientError> {
        let body = self.post(request).await?;
        serde_json::from_slice(&body).map_err(|source| ClientError::Decode {
            body: String::from_utf8_lossy(&body).into_owned(),
            source,
        })
    }

    async fn send(&self, body: Vec<u8>) -> Result<Response<Body>, ClientError> {
        let builder = Request::builder()
            .method(Method::POST)
            .header("Content-Type", "application/json");

        // No idle connections: each invocation is a fresh process anyway.
        let result = match &self.endpoint {
            Endpoint::Unix(path) => {
                let request = builder
                    .uri(hyperlocal::Uri::new(path, "/"))
                    .body(Body::from(body))?;
                Client::builder()
                    .pool_max_idle_per_host(0)
                    .build::<_, Body>(UnixConnector)
                    .request(request)
                    .await
            }
            Endpoint::Tcp(addr) => {
                let request = builder
                    .uri(format!("http://{addr}/"))
                    .body(Body::from(body))?;
                Client::builder()
                    .pool_max_idle_per_host(0)
                    .build_http::<Body>()
                    .request(request)
                    .await
            }
        };

        result.map_err(|e| {
            if e.is_connect() {
                ClientError::Connect {
                    endpoint: self.endpoint.to_string(),
                    source: e,
                }
            } else {
                ClientError::Send(e)
            }
        })
    }
}
