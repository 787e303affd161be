//! Integration tests for the control socket.
//!
//! Runs the server on a Unix socket in a temp directory with in-memory
//! kernel, switch and annotation store, and drives it over HTTP the way the
//! shim does.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixConnector, Uri};
use ovnk_cni_server::annotations::MockAnnotationStore;
use ovnk_cni_server::mock::{MockKernel, HOST_NS};
use ovnk_cni_server::ovs::{MockVsctl, Ovs};
use ovnk_cni_server::provision::Provisioner;
use ovnk_cni_server::sriov::MockDeviceTree;
use ovnk_cni_server::{server, Backoff, Handler};
use ovnk_cni_types::{CniRequest, CniResponse, POD_NETWORK_ANNOTATION};
use tokio::sync::oneshot;

const SANDBOX: &str = "c0ffee00c0ffee00c0ffee00c0ffee00";
const NETNS: &str = "/var/run/netns/cni-web-0";

struct TestServer {
    socket: PathBuf,
    store: Arc<MockAnnotationStore>,
    kernel: Arc<MockKernel>,
    vsctl: Arc<MockVsctl>,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("run/ovn-cni-server.sock");

        let store = Arc::new(MockAnnotationStore::new());
        let kernel = Arc::new(MockKernel::new());
        kernel.add_netns(NETNS);
        let vsctl = Arc::new(MockVsctl::new());

        let handler = Handler::new(
            store.clone(),
            Provisioner::new(kernel.clone(), kernel.clone(), Arc::new(MockDeviceTree::new())),
            Ovs::new(vsctl.clone(), "br-int"),
            1400,
        )
        .with_backoff(Backoff {
            initial: Duration::from_millis(1),
            ..Backoff::annotation().without_jitter()
        });

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn({
            let socket = socket.clone();
            async move {
                server::serve_unix(Arc::new(handler), &socket, async {
                    let _ = rx.await;
                })
                .await
            }
        });

        wait_for_socket(&socket).await;

        Self {
            socket,
            store,
            kernel,
            vsctl,
            shutdown: Some(tx),
            task,
            _dir: dir,
        }
    }

    async fn post(&self, body: Body) -> (StatusCode, Vec<u8>) {
        self.send(Method::POST, "/", body).await
    }

    async fn send(&self, method: Method, path: &str, body: Body) -> (StatusCode, Vec<u8>) {
        let client = Client::builder().build::<_, Body>(UnixConnector);
        let request = Request::builder()
            .method(method)
            .uri(Uri::new(&self.socket, path))
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = client.request(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server did not start on {}", path.display());
}

fn cni_request(command: &str) -> CniRequest {
    CniRequest::new(
        [
            format!("CNI_COMMAND={command}"),
            format!("CNI_CONTAINERID={SANDBOX}"),
            format!("CNI_NETNS={NETNS}"),
            "CNI_IFNAME=eth0".to_string(),
            "CNI_ARGS=IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-0".to_string(),
            "PATH=/opt/cni/bin".to_string(),
        ],
        br#"{"cniVersion":"0.4.0","name":"ovn-kubernetes","type":"ovn-k8s-cni-overlay"}"#.to_vec(),
    )
}

fn json_body(request: &CniRequest) -> Body {
    Body::from(serde_json::to_vec(request).unwrap())
}

#[tokio::test]
async fn test_add_over_socket() {
    let server = TestServer::start().await;
    server.store.set(
        "default",
        "web-0",
        POD_NETWORK_ANNOTATION,
        r#"{"ip_address":"10.1.2.3/24","mac_address":"0a:00:00:00:00:01","gateway_ip":"10.1.2.1"}"#,
    );

    let (status, body) = server.post(json_body(&cni_request("ADD"))).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));

    let response: CniResponse = serde_json::from_slice(&body).unwrap();
    let result = response.result.unwrap();
    assert_eq!(result.cni_version, "0.4.0");
    assert_eq!(result.ips[0].address.to_string(), "10.1.2.3/24");
    assert_eq!(result.ips[0].gateway.unwrap().to_string(), "10.1.2.1");
    assert_eq!(result.interfaces[1].mac, "0a:00:00:00:00:01");
    assert_eq!(result.interfaces[0].name, "c0ffee00c0ffee0");

    assert!(server.kernel.link(NETNS, "eth0").is_some());
    assert!(server.kernel.link(HOST_NS, "c0ffee00c0ffee0").is_some());
    assert_eq!(server.vsctl.ports(), vec!["c0ffee00c0ffee0".to_string()]);

    server.stop().await;
}

#[tokio::test]
async fn test_socket_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let server = TestServer::start().await;
    let mode = std::fs::metadata(&server.socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    server.stop().await;
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("cni.sock");
    std::fs::write(&socket, b"stale").unwrap();

    let handler = Handler::new(
        Arc::new(MockAnnotationStore::new()),
        Provisioner::new(
            Arc::new(MockKernel::new()),
            Arc::new(MockKernel::new()),
            Arc::new(MockDeviceTree::new()),
        ),
        Ovs::new(Arc::new(MockVsctl::new()), "br-int"),
        1400,
    );
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn({
        let socket = socket.clone();
        async move {
            server::serve_unix(Arc::new(handler), &socket, async {
                let _ = rx.await;
            })
            .await
        }
    });

    wait_for_socket(&socket).await;
    let _ = tx.send(());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_missing_annotation_times_out_with_error() {
    let server = TestServer::start().await;

    let (status, body) = server.post(json_body(&cni_request("ADD"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("default/web-0"));
    assert_eq!(server.store.calls(), 7);
    assert!(server.kernel.ops().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_annotation_is_not_retried() {
    let server = TestServer::start().await;
    server
        .store
        .set("default", "web-0", POD_NETWORK_ANNOTATION, "{not json");

    let (status, _) = server.post(json_body(&cni_request("ADD"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(server.store.calls(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_del_twice_succeeds() {
    let server = TestServer::start().await;

    for _ in 0..2 {
        let (status, body) = server.post(json_body(&cni_request("DEL"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"{}");
    }
    assert_eq!(
        server
            .vsctl
            .calls()
            .iter()
            .filter(|c| c.starts_with("del-port br-int c0ffee00c0ffee0"))
            .count(),
        2
    );

    server.stop().await;
}

#[tokio::test]
async fn test_bad_requests() {
    let server = TestServer::start().await;

    let (status, _) = server.post(Body::from("not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server.send(Method::GET, "/", Body::empty()).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, _) = server
        .send(Method::POST, "/metrics", json_body(&cni_request("ADD")))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = server.post(json_body(&cni_request("VERSION"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("unsupported CNI command"));

    server.stop().await;
}
