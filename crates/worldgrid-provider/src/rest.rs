//! Compute Engine v1 REST client.
//!
//! Speaks plain HTTP/1 through hyper; TLS termination is expected from a
//! local proxy or emulator sitting at `provider.endpoint`.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use worldgrid_core::config::ProviderConfig;
use worldgrid_core::{OperationHandle, OperationKind, OperationStatus};

use crate::error::{ProviderError, ProviderResult};
use crate::types::*;
use crate::{ComputeProvider, ProviderFuture};

/// REST client for a Compute Engine compatible endpoint.
#[derive(Debug, Clone)]
pub struct HttpComputeProvider {
    /// host:port to connect to.
    authority: String,
    /// Path prefix, e.g. `/compute/v1`.
    base_path: String,
    project: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpComputeProvider {
    pub fn new(
        endpoint: &str,
        project: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> ProviderResult<Self> {
        let uri: Uri = endpoint
            .parse()
            .map_err(|e| ProviderError::Config(format!("invalid endpoint {endpoint}: {e}")))?;
        if uri.scheme_str() != Some("http") {
            return Err(ProviderError::Config(format!(
                "endpoint must be plain http (got {endpoint})"
            )));
        }
        let authority = uri
            .authority()
            .map(|a| {
                if a.port().is_some() {
                    a.to_string()
                } else {
                    format!("{}:80", a.host())
                }
            })
            .ok_or_else(|| ProviderError::Config(format!("endpoint {endpoint} has no host")))?;
        Ok(Self {
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            project: project.to_string(),
            token,
            timeout,
        })
    }

    /// Build a client from configuration, reading the bearer token from the
    /// configured environment variable when present.
    pub fn from_config(config: &ProviderConfig) -> ProviderResult<Self> {
        let token = std::env::var(&config.token_env).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            warn!(env = %config.token_env, "no provider token set; sending unauthenticated requests");
        }
        Self::new(
            &config.endpoint,
            &config.project,
            token,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn zone_path(&self, zone: &str, rest: &str) -> String {
        format!(
            "{}/projects/{}/zones/{zone}/{rest}",
            self.base_path, self.project
        )
    }

    /// Project-relative resource link, accepted by the API in request bodies.
    fn link(&self, rest: &str) -> String {
        format!("projects/{}/{rest}", self.project)
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> ProviderResult<Value> {
        let result = tokio::time::timeout(self.timeout, self.send(method.clone(), path, body)).await;
        match result {
            Ok(response) => response,
            Err(_) => {
                debug!(%method, %path, "provider request timed out");
                Err(ProviderError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> ProviderResult<Value> {
        let stream = tokio::net::TcpStream::connect(&self.authority)
            .await
            .map_err(|e| ProviderError::Transport(format!("connect {}: {e}", self.authority)))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let payload = match &body {
            Some(value) => {
                Bytes::from(serde_json::to_vec(value).map_err(|e| ProviderError::Decode(e.to_string()))?)
            }
            None => Bytes::new(),
        };

        let mut builder = http::Request::builder()
            .method(&method)
            .uri(path)
            .header("host", &self.authority)
            .header("user-agent", "worldgrid/0.1")
            .header("accept", "application/json");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        if let Some(token) = &self.token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let req = builder
            .body(Full::new(payload))
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?
            .to_bytes();

        debug!(%method, %path, %status, "provider response");
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: api_error_message(&bytes),
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn operation_call(
        &self,
        method: Method,
        path: String,
        body: Option<Value>,
    ) -> ProviderResult<Operation> {
        let value = self.request(method, &path, body).await?;
        parse_operation(value)
    }
}

// ── Wire format ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOperation {
    name: String,
    #[serde(default)]
    operation_type: String,
    status: OperationStatus,
    #[serde(default)]
    target_id: String,
    #[serde(default)]
    error: Option<WireOperationError>,
}

#[derive(Debug, Deserialize)]
struct WireOperationError {
    #[serde(default)]
    errors: Vec<WireErrorItem>,
}

#[derive(Debug, Deserialize)]
struct WireErrorItem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInstanceList {
    #[serde(default)]
    items: Vec<WireInstance>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInstance {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    zone: String,
    status: InstanceStatus,
    #[serde(default)]
    network_interfaces: Vec<WireNetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNetworkInterface {
    #[serde(default)]
    access_configs: Vec<WireAccessConfig>,
}

#[derive(Debug, Deserialize)]
struct WireAccessConfig {
    #[serde(default, rename = "natIP")]
    nat_ip: Option<String>,
}

fn parse_operation(value: Value) -> ProviderResult<Operation> {
    let wire: WireOperation =
        serde_json::from_value(value).map_err(|e| ProviderError::Decode(e.to_string()))?;
    let target_id = parse_id(&wire.target_id)?;
    let error = wire.error.and_then(|e| {
        let messages: Vec<String> = e
            .errors
            .into_iter()
            .map(|item| format!("{}: {}", item.code, item.message))
            .collect();
        if messages.is_empty() {
            None
        } else {
            Some(messages.join("; "))
        }
    });
    Ok(Operation {
        handle: OperationHandle::new(wire.name),
        kind: OperationKind::from(wire.operation_type),
        status: wire.status,
        target_id,
        error,
    })
}

fn parse_id(raw: &str) -> ProviderResult<i64> {
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse::<u64>()
        .map(|id| id as i64)
        .map_err(|e| ProviderError::Decode(format!("invalid resource id {raw:?}: {e}")))
}

fn into_instance(wire: WireInstance) -> ProviderResult<Instance> {
    let nat_ip = wire
        .network_interfaces
        .iter()
        .flat_map(|nic| nic.access_configs.iter())
        .find_map(|ac| ac.nat_ip.clone());
    Ok(Instance {
        id: parse_id(&wire.id)?,
        name: wire.name,
        zone: last_segment(&wire.zone).to_string(),
        status: wire.status,
        nat_ip,
    })
}

/// Resource links are full URLs; callers want the trailing name.
fn last_segment(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}

fn api_error_message(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

impl HttpComputeProvider {
    fn instance_body(&self, zone: &str, spec: &InstanceSpec) -> Value {
        let mut disks = vec![json!({
            "boot": true,
            "autoDelete": true,
            "deviceName": spec.name,
            "mode": "READ_WRITE",
            "initializeParams": {
                "sourceImage": self.link(&spec.boot_disk.source_image),
                "diskType": self.link(&format!("zones/{zone}/diskTypes/{}", spec.boot_disk.disk_type)),
                "diskSizeGb": spec.boot_disk.size_gb.to_string(),
            },
        })];
        for disk in &spec.attached_disks {
            disks.push(json!({
                "boot": false,
                "autoDelete": true,
                "deviceName": disk,
                "mode": "READ_WRITE",
                "source": self.link(&format!("zones/{zone}/disks/{disk}")),
            }));
        }

        let mut access_config = json!({ "name": "External NAT", "type": "ONE_TO_ONE_NAT" });
        if let Some(ip) = spec.nat_ip.as_deref().filter(|ip| !ip.is_empty()) {
            access_config["natIP"] = json!(ip);
        }

        let metadata: Vec<Value> = spec
            .metadata
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();

        json!({
            "name": spec.name,
            "machineType": self.link(&format!("zones/{zone}/machineTypes/{}", spec.machine_type)),
            "disks": disks,
            "canIpForward": false,
            "networkInterfaces": [{
                "network": self.link("global/networks/default"),
                "accessConfigs": [access_config],
            }],
            "tags": { "items": spec.tags },
            "metadata": { "items": metadata },
            "serviceAccounts": [{
                "email": "default",
                "scopes": [
                    "https://www.googleapis.com/auth/devstorage.read_write",
                    "https://www.googleapis.com/auth/compute",
                    "https://www.googleapis.com/auth/logging.write",
                ],
            }],
            "scheduling": {
                "automaticRestart": false,
                "onHostMaintenance": "TERMINATE",
                "preemptible": spec.preemptible,
            },
        })
    }
}

impl ComputeProvider for HttpComputeProvider {
    fn list_instances<'a>(&'a self, zone: &'a str) -> ProviderFuture<'a, Vec<Instance>> {
        Box::pin(async move {
            let mut instances = Vec::new();
            let mut page_token: Option<String> = None;
            loop {
                let mut path = self.zone_path(zone, "instances");
                if let Some(token) = &page_token {
                    path.push_str("?pageToken=");
                    path.push_str(token);
                }
                let value = self.request(Method::GET, &path, None).await?;
                let page: WireInstanceList = serde_json::from_value(value)
                    .map_err(|e| ProviderError::Decode(e.to_string()))?;
                for wire in page.items {
                    instances.push(into_instance(wire)?);
                }
                match page.next_page_token.filter(|t| !t.is_empty()) {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
            Ok(instances)
        })
    }

    fn insert_instance<'a>(
        &'a self,
        zone: &'a str,
        spec: &'a InstanceSpec,
        request_id: &'a str,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let path = format!(
                "{}?requestId={request_id}",
                self.zone_path(zone, "instances")
            );
            let body = self.instance_body(zone, spec);
            self.operation_call(Method::POST, path, Some(body)).await
        })
    }

    fn start_instance<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let path = self.zone_path(zone, &format!("instances/{name}/start"));
            self.operation_call(Method::POST, path, None).await
        })
    }

    fn reset_instance<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let path = self.zone_path(zone, &format!("instances/{name}/reset"));
            self.operation_call(Method::POST, path, None).await
        })
    }

    fn delete_instance<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let path = self.zone_path(zone, &format!("instances/{name}"));
            self.operation_call(Method::DELETE, path, None).await
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        zone: &'a str,
        disk: &'a str,
        snapshot: &'a str,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let path = self.zone_path(zone, &format!("disks/{disk}/createSnapshot"));
            let body = json!({ "name": snapshot });
            self.operation_call(Method::POST, path, Some(body)).await
        })
    }

    fn insert_disk<'a>(
        &'a self,
        zone: &'a str,
        spec: &'a DiskSpec,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let path = self.zone_path(zone, "disks");
            let body = json!({
                "name": spec.name,
                "sizeGb": spec.size_gb.to_string(),
                "sourceSnapshot": self.link(&format!("global/snapshots/{}", spec.source_snapshot)),
                "type": self.link(&format!("zones/{zone}/diskTypes/{}", spec.disk_type)),
            });
            self.operation_call(Method::POST, path, Some(body)).await
        })
    }

    fn get_operation<'a>(
        &'a self,
        zone: &'a str,
        handle: &'a OperationHandle,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let path = self.zone_path(zone, &format!("operations/{handle}"));
            self.operation_call(Method::GET, path, None).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serve one canned response per accepted connection and hand back
    /// the raw request heads.
    async fn serve(responses: Vec<(u16, String)>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut heads = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let head = read_request(&mut stream).await;
                heads.push(head);
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(reply.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
            heads
        });
        (format!("http://{addr}/compute/v1"), handle)
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let lower = line.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length || n == 0 {
                    return text;
                }
            }
            if n == 0 {
                return text;
            }
        }
    }

    fn client(endpoint: &str) -> HttpComputeProvider {
        HttpComputeProvider::new(
            endpoint,
            "craft",
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn rejects_non_http_endpoint() {
        let err = HttpComputeProvider::new(
            "https://compute.googleapis.com/compute/v1",
            "craft",
            None,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[test]
    fn parses_done_operation_with_error() {
        let value = json!({
            "name": "operation-123",
            "operationType": "insert",
            "status": "DONE",
            "targetId": "8472910354",
            "error": { "errors": [{ "code": "QUOTA_EXCEEDED", "message": "CPUS" }] }
        });
        let op = parse_operation(value).unwrap();
        assert_eq!(op.handle.as_str(), "operation-123");
        assert_eq!(op.kind, OperationKind::Insert);
        assert!(op.is_done());
        assert_eq!(op.target_id, 8472910354);
        assert_eq!(op.error.as_deref(), Some("QUOTA_EXCEEDED: CPUS"));
    }

    #[test]
    fn instance_body_carries_template_fields() {
        let provider = client("http://127.0.0.1:1/compute/v1");
        let mut metadata = BTreeMap::new();
        metadata.insert("world".to_string(), "alpha".to_string());
        let spec = InstanceSpec {
            name: "minecraft-alpha".to_string(),
            machine_type: "n1-standard-4".to_string(),
            boot_disk: BootDisk {
                source_image: "global/images/minecraft".to_string(),
                disk_type: "pd-ssd".to_string(),
                size_gb: 100,
            },
            attached_disks: vec!["minecraft-overviewer-world-alpha".to_string()],
            nat_ip: Some("203.0.113.7".to_string()),
            tags: vec!["minecraft-server".to_string()],
            metadata,
            preemptible: true,
        };

        let body = provider.instance_body("asia-east1-b", &spec);
        assert_eq!(
            body["machineType"],
            "projects/craft/zones/asia-east1-b/machineTypes/n1-standard-4"
        );
        assert_eq!(body["disks"].as_array().unwrap().len(), 2);
        assert_eq!(
            body["networkInterfaces"][0]["accessConfigs"][0]["natIP"],
            "203.0.113.7"
        );
        assert_eq!(body["metadata"]["items"][0]["key"], "world");
        assert_eq!(body["scheduling"]["preemptible"], true);
    }

    #[tokio::test]
    async fn get_operation_hits_zonal_path_with_bearer_token() {
        let body = json!({
            "name": "operation-9",
            "operationType": "delete",
            "status": "RUNNING",
            "targetId": "77"
        })
        .to_string();
        let (endpoint, server) = serve(vec![(200, body)]).await;

        let op = client(&endpoint)
            .get_operation("asia-east1-b", &OperationHandle::new("operation-9"))
            .await
            .unwrap();
        assert_eq!(op.kind, OperationKind::Delete);
        assert_eq!(op.status, OperationStatus::Running);

        let heads = server.await.unwrap();
        assert!(heads[0].starts_with(
            "GET /compute/v1/projects/craft/zones/asia-east1-b/operations/operation-9 "
        ));
        assert!(heads[0].to_ascii_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn list_instances_follows_page_tokens() {
        let first = json!({
            "items": [{
                "id": "1",
                "name": "minecraft-alpha",
                "zone": "https://www.googleapis.com/compute/v1/projects/craft/zones/asia-east1-b",
                "status": "TERMINATED"
            }],
            "nextPageToken": "p2"
        })
        .to_string();
        let second = json!({
            "items": [{
                "id": "2",
                "name": "minecraft-overviewer-alpha",
                "zone": "asia-east1-b",
                "status": "REPAIRING",
                "networkInterfaces": [{ "accessConfigs": [{ "natIP": "198.51.100.4" }] }]
            }]
        })
        .to_string();
        let (endpoint, server) = serve(vec![(200, first), (200, second)]).await;

        let instances = client(&endpoint).list_instances("asia-east1-b").await.unwrap();
        assert_eq!(instances.len(), 2);
        assert!(instances[0].status.is_terminated());
        assert_eq!(instances[0].zone, "asia-east1-b");
        assert_eq!(instances[1].status, InstanceStatus::Unknown);
        assert_eq!(instances[1].nat_ip.as_deref(), Some("198.51.100.4"));

        let heads = server.await.unwrap();
        assert!(heads[1].contains("instances?pageToken=p2"));
    }

    #[tokio::test]
    async fn api_errors_surface_status_and_message() {
        let body = json!({ "error": { "code": 409, "message": "already exists" } }).to_string();
        let (endpoint, server) = serve(vec![(409, body)]).await;

        let err = client(&endpoint)
            .create_snapshot("asia-east1-b", "minecraft-world-beta", "snap")
            .await
            .unwrap_err();
        match err {
            ProviderError::Api { status, message } => {
                assert_eq!(status, 409);
                assert_eq!(message, "already exists");
            }
            other => panic!("unexpected error: {other}"),
        }
        let heads = server.await.unwrap();
        assert!(heads[0].contains("\"name\":\"snap\""));
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(&format!("http://{addr}/compute/v1"))
            .list_instances("asia-east1-b")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)));
    }
}
