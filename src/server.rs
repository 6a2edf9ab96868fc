//! Listener endpoint and request dispatch.
//!
//! The node service is exposed on a `unix://PATH` or `tcp://HOST:PORT`
//! endpoint. Each connection carries newline-delimited JSON envelopes:
//! a request line `{"method": ..., "params": ...}` is answered with
//! `{"result": ...}` or `{"error": {"code": ..., "message": ...}}`,
//! where the code is the numeric gRPC status code.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tonic::Status;
use tracing::{debug, error, info, warn};

use crate::csi::*;
use crate::node::NodeService;

/// A parsed listener endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(String),
    Tcp(String),
}

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse an endpoint URI. Only the `unix` and `tcp` schemes with a
/// non-empty authority are valid; anything else is a configuration error.
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint, ServeError> {
    let lowered = endpoint.to_lowercase();
    if lowered.starts_with("unix://") || lowered.starts_with("tcp://") {
        if let Some((scheme, rest)) = endpoint.split_once("://") {
            if !rest.is_empty() {
                return Ok(if scheme.eq_ignore_ascii_case("unix") {
                    Endpoint::Unix(rest.to_string())
                } else {
                    Endpoint::Tcp(rest.to_string())
                });
            }
        }
    }
    Err(ServeError::InvalidEndpoint(endpoint.to_string()))
}

/// Request envelope, tagged with the CSI verb name.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RpcRequest {
    NodePublishVolume(NodePublishVolumeRequest),
    NodeUnpublishVolume(NodeUnpublishVolumeRequest),
    NodeStageVolume(NodeStageVolumeRequest),
    NodeUnstageVolume(NodeUnstageVolumeRequest),
    NodeGetInfo(NodeGetInfoRequest),
    NodeGetCapabilities(NodeGetCapabilitiesRequest),
    NodeExpandVolume(Value),
    NodeGetVolumeStats(Value),
}

/// Bind the endpoint and serve requests until the listener fails.
pub async fn serve(endpoint: &str, node: Arc<NodeService>) -> Result<(), ServeError> {
    match parse_endpoint(endpoint)? {
        Endpoint::Unix(path) => {
            // A socket left behind by a previous instance would make the
            // bind fail.
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = %path, "removed stale socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let listener = UnixListener::bind(&path)?;
            info!(endpoint = %endpoint, "node plugin listening");
            loop {
                let (stream, _) = listener.accept().await?;
                let node = node.clone();
                tokio::spawn(async move { handle_connection(stream, node).await });
            }
        }
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(&addr).await?;
            info!(endpoint = %endpoint, "node plugin listening");
            loop {
                let (stream, peer) = listener.accept().await?;
                debug!(peer = %peer, "connection accepted");
                let node = node.clone();
                tokio::spawn(async move { handle_connection(stream, node).await });
            }
        }
    }
}

async fn handle_connection<S>(stream: S, node: Arc<NodeService>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "connection read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = dispatch_line(&node, &line).await;
        if writer.write_all(reply.as_bytes()).await.is_err()
            || writer.write_all(b"\n").await.is_err()
        {
            return;
        }
    }
}

/// Parse one request line, run the verb, and render the reply envelope.
pub async fn dispatch_line(node: &NodeService, line: &str) -> String {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return render(Err(Status::invalid_argument(format!(
                "malformed request: {e}"
            ))));
        }
    };
    render(dispatch(node, request).await)
}

async fn dispatch(node: &NodeService, request: RpcRequest) -> Result<Value, Status> {
    match request {
        RpcRequest::NodePublishVolume(req) => {
            debug!(volume_id = %req.volume_id, "NodePublishVolume");
            node.node_publish_volume(req).await.map(to_value)
        }
        RpcRequest::NodeUnpublishVolume(req) => {
            debug!(volume_id = %req.volume_id, "NodeUnpublishVolume");
            node.node_unpublish_volume(req).await.map(to_value)
        }
        RpcRequest::NodeStageVolume(req) => node.node_stage_volume(req).await.map(to_value),
        RpcRequest::NodeUnstageVolume(req) => node.node_unstage_volume(req).await.map(to_value),
        RpcRequest::NodeGetInfo(req) => node.node_get_info(req).await.map(to_value),
        RpcRequest::NodeGetCapabilities(req) => {
            node.node_get_capabilities(req).await.map(to_value)
        }
        RpcRequest::NodeExpandVolume(_) => node.node_expand_volume().await.map(|_| json!({})),
        RpcRequest::NodeGetVolumeStats(_) => node.node_get_volume_stats().await.map(|_| json!({})),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn render(result: Result<Value, Status>) -> String {
    let envelope = match result {
        Ok(value) => json!({ "result": value }),
        Err(status) => {
            error!(code = ?status.code(), message = %status.message(), "request failed");
            json!({
                "error": {
                    "code": status.code() as i32,
                    "message": status.message(),
                }
            })
        }
    };
    envelope.to_string()
}
