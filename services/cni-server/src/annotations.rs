//! Pod network info resolution from pod annotations.
//!
//! The cluster controller assigns each pod a MAC, IP and gateway and publishes
//! them as a JSON annotation on the pod. The annotation may not exist yet when
//! the runtime calls the plugin, so reads are retried under backoff.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ovnk_cni_types::{PodAnnotation, TypesError, POD_NETWORK_ANNOTATION};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::{retry_until, Backoff, RetryError};

/// Pod annotation carrying the pod's ingress rate limit.
pub const INGRESS_BANDWIDTH_ANNOTATION: &str = "kubernetes.io/ingress-bandwidth";

/// Pod annotation carrying the pod's egress rate limit.
pub const EGRESS_BANDWIDTH_ANNOTATION: &str = "kubernetes.io/egress-bandwidth";

/// Errors from annotation lookups.
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to read {path}: {source}")]
    Credentials {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out waiting for pod {namespace}/{name} annotation after {attempts} attempts")]
    Timeout {
        namespace: String,
        name: String,
        attempts: u32,
    },

    #[error("pod {namespace}/{name}: {source}")]
    Malformed {
        namespace: String,
        name: String,
        #[source]
        source: TypesError,
    },

    #[error("pod {namespace}/{name}: invalid {annotation} value {value:?}")]
    InvalidBandwidth {
        namespace: String,
        name: String,
        annotation: &'static str,
        value: String,
    },
}

/// Read access to pod annotations.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Fetch all annotations of a pod.
    async fn pod_annotations(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HashMap<String, String>, AnnotationError>;
}

// =============================================================================
// Kubernetes API client
// =============================================================================

/// Minimal Kubernetes API client for reading pod metadata.
pub struct KubeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    /// Create a client for the given API server URL.
    pub fn new(
        base_url: &str,
        token_file: Option<&Path>,
        ca_file: Option<&Path>,
    ) -> Result<Self, AnnotationError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));

        if let Some(ca_file) = ca_file {
            let pem = read_credential(ca_file)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem.as_bytes())?);
        }

        let token = token_file
            .map(read_credential)
            .transpose()?
            .map(|t| t.trim().to_string());

        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

fn read_credential(path: &Path) -> Result<String, AnnotationError> {
    std::fs::read_to_string(path).map_err(|source| AnnotationError::Credentials {
        path: path.display().to_string(),
        source,
    })
}

#[derive(Deserialize)]
struct PodObject {
    metadata: PodMetadata,
}

#[derive(Deserialize)]
struct PodMetadata {
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[async_trait]
impl AnnotationStore for KubeClient {
    async fn pod_annotations(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HashMap<String, String>, AnnotationError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, namespace, name
        );
        debug!(url = %url, "Fetching pod");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AnnotationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let pod: PodObject = response.json().await?;
        Ok(pod.metadata.annotations)
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Everything the annotations say about a pod's networking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    /// Assigned network identity.
    pub identity: PodAnnotation,

    /// Requested rate limits.
    pub bandwidth: Bandwidth,
}

/// Wait for the pod network annotation and decode it.
///
/// Lookup errors are logged and retried; a payload that fails to decode is
/// returned immediately since retrying cannot fix it.
pub async fn get_pod_info(
    store: &dyn AnnotationStore,
    namespace: &str,
    name: &str,
    backoff: &Backoff,
) -> Result<PodInfo, AnnotationError> {
    let result = retry_until(backoff, |attempt| async move {
        let annotations = match store.pod_annotations(namespace, name).await {
            Ok(annotations) => annotations,
            Err(e) => {
                warn!(
                    namespace,
                    pod = name,
                    attempt,
                    error = %e,
                    "Error while obtaining pod annotations"
                );
                return Ok(None);
            }
        };

        let Some(raw) = annotations.get(POD_NETWORK_ANNOTATION) else {
            return Ok(None);
        };

        let identity =
            PodAnnotation::from_json(raw).map_err(|source| AnnotationError::Malformed {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            })?;
        let bandwidth = Bandwidth::from_annotations(&annotations).map_err(
            |(annotation, value)| AnnotationError::InvalidBandwidth {
                namespace: namespace.to_string(),
                name: name.to_string(),
                annotation,
                value,
            },
        )?;

        Ok::<_, AnnotationError>(Some(PodInfo {
            identity,
            bandwidth,
        }))
    })
    .await;

    match result {
        Ok(info) => Ok(info),
        Err(RetryError::Aborted(e)) => Err(e),
        Err(RetryError::Exhausted { attempts }) => Err(AnnotationError::Timeout {
            namespace: namespace.to_string(),
            name: name.to_string(),
            attempts,
        }),
    }
}

// =============================================================================
// Bandwidth
// =============================================================================

/// Requested pod rate limits, in bits per second. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bandwidth {
    /// Traffic into the pod.
    pub ingress_bps: u64,

    /// Traffic out of the pod.
    pub egress_bps: u64,
}

impl Bandwidth {
    /// Whether any limit is requested.
    pub fn is_limited(&self) -> bool {
        self.ingress_bps > 0 || self.egress_bps > 0
    }

    /// Read the bandwidth annotations; on error returns the offending key and value.
    fn from_annotations(
        annotations: &HashMap<String, String>,
    ) -> Result<Self, (&'static str, String)> {
        let read = |key: &'static str| match annotations.get(key) {
            Some(value) => parse_quantity(value).ok_or_else(|| (key, value.clone())),
            None => Ok(0),
        };

        Ok(Self {
            ingress_bps: read(INGRESS_BANDWIDTH_ANNOTATION)?,
            egress_bps: read(EGRESS_BANDWIDTH_ANNOTATION)?,
        })
    }
}

/// Parse a resource quantity such as `10M`, `1Gi` or `500k`.
fn parse_quantity(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    let number: f64 = number.parse().ok()?;
    let bps = number * multiplier;
    (bps.is_finite() && bps >= 0.0).then_some(bps as u64)
}

// =============================================================================
// Mock
// =============================================================================

/// In-memory annotation store for testing and development.
///
/// Annotations become visible after a configurable number of lookups, which
/// models the controller writing them while the plugin is already waiting.
#[derive(Default)]
pub struct MockAnnotationStore {
    pods: Mutex<HashMap<(String, String), HashMap<String, String>>>,
    ready_after: AtomicU32,
    calls: AtomicU32,
}

impl MockAnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an annotation on a pod.
    pub fn set(&self, namespace: &str, name: &str, key: &str, value: &str) {
        if let Ok(mut pods) = self.pods.lock() {
            pods.entry((namespace.to_string(), name.to_string()))
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
    }

    /// Fail the first `n` lookups.
    pub fn fail_first(&self, n: u32) {
        self.ready_after.store(n, Ordering::SeqCst);
    }

    /// Number of lookups served so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnnotationStore for MockAnnotationStore {
    async fn pod_annotations(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HashMap<String, String>, AnnotationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.ready_after.load(Ordering::SeqCst) {
            return Err(AnnotationError::Api {
                status: 503,
                message: "apiserver unavailable".to_string(),
            });
        }

        let pods = self.pods.lock().map_err(|_| AnnotationError::Api {
            status: 500,
            message: "mock store poisoned".to_string(),
        })?;
        match pods.get(&(namespace.to_string(), name.to_string())) {
            Some(annotations) => Ok(annotations.clone()),
            None => Err(AnnotationError::Api {
                status: 404,
                message: format!("pods \"{}\" not found", name),
            }),
        }
    }
}
