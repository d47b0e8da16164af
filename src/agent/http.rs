//! HTTP Node Agent Client
//!
//! Talks to node agents over their REST API:
//! `PUT|DELETE <agent_url><prefix>/meshes/<id>` and `GET .../status`.

use std::time::Duration;

use uuid::Uuid;

use super::{AgentStatus, NodeAgent};
use crate::error::{Error, Result};
use crate::mesh::{keys::validate_public_key, InterfaceSpec};
use crate::node::Node;

/// Longest rejection body kept in error messages
const MAX_REASON_LEN: usize = 512;

/// Node agent reached over HTTP
pub struct HttpNodeAgent {
    client: reqwest::Client,
    api_prefix: String,
}

impl HttpNodeAgent {
    /// Create a new agent client
    pub fn new(connect_timeout: Duration, request_timeout: Duration, api_prefix: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_prefix: format!("/{}", api_prefix.trim_matches('/')),
        })
    }

    fn mesh_url(&self, node: &Node, mesh_id: Uuid) -> String {
        let prefix = if self.api_prefix == "/" { "" } else { &self.api_prefix };
        format!("{}{}/meshes/{}", node.agent_url, prefix, mesh_id)
    }

    /// Turn a transport failure or non-2xx response into an agent error
    async fn check(node: &Node, result: reqwest::Result<reqwest::Response>) -> Result<reqwest::Response> {
        let response = result.map_err(|e| Error::AgentUnreachable {
            node_id: node.id.clone(),
            reason: if e.is_timeout() {
                "request timed out".to_string()
            } else {
                e.to_string()
            },
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let mut reason = format!("HTTP {}", status.as_u16());
        let body = body.trim();
        if !body.is_empty() {
            reason.push_str(": ");
            reason.extend(body.chars().take(MAX_REASON_LEN));
        }

        Err(Error::AgentRejected {
            node_id: node.id.clone(),
            reason,
        })
    }
}

#[async_trait::async_trait]
impl NodeAgent for HttpNodeAgent {
    async fn apply(&self, node: &Node, mesh_id: Uuid, spec: &InterfaceSpec) -> Result<()> {
        let url = self.mesh_url(node, mesh_id);
        tracing::debug!("Applying mesh {} on node {} via {}", mesh_id, node.id, url);
        Self::check(node, self.client.put(&url).json(spec).send().await).await?;
        Ok(())
    }

    async fn remove(&self, node: &Node, mesh_id: Uuid) -> Result<()> {
        let url = self.mesh_url(node, mesh_id);
        tracing::debug!("Removing mesh {} from node {} via {}", mesh_id, node.id, url);
        Self::check(node, self.client.delete(&url).send().await).await?;
        Ok(())
    }

    async fn status(&self, node: &Node, mesh_id: Uuid) -> Result<AgentStatus> {
        let url = format!("{}/status", self.mesh_url(node, mesh_id));
        let response = Self::check(node, self.client.get(&url).send().await).await?;
        let invalid = |detail: String| Error::AgentRejected {
            node_id: node.id.clone(),
            reason: format!("invalid status payload: {}", detail),
        };

        let status = response
            .json::<AgentStatus>()
            .await
            .map_err(|e| invalid(e.to_string()))?;
        for peer in &status.peers {
            validate_public_key(&peer.public_key).map_err(|e| invalid(e.to_string()))?;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentPeerStatus;
    use crate::mesh::{KeyPair, Transport};
    use crate::node::NodeRole;
    use axum::{
        extract::Path,
        http::StatusCode,
        response::IntoResponse,
        routing::{get, put},
        Json, Router,
    };
    use chrono::Utc;

    fn node(agent_url: String) -> Node {
        Node {
            id: "edge-1".into(),
            name: "edge-1".into(),
            role: NodeRole::Server,
            public_host: None,
            agent_url,
            fingerprint: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn spec(mtu: u16) -> InterfaceSpec {
        InterfaceSpec {
            interface_name: "wolfmesh0".into(),
            private_key: "key".into(),
            address: "10.88.0.1/32".parse().unwrap(),
            mtu,
            transport: Transport::Udp,
            listen_ports: vec![],
            peers: vec![],
        }
    }

    /// Minimal agent: accepts MTU >= 1280, reports one connected peer. The
    /// nil mesh reports a garbled peer key.
    async fn spawn_fake_agent() -> String {
        let app = Router::new()
            .route(
                "/v1/meshes/:id",
                put(|Json(spec): Json<InterfaceSpec>| async move {
                    if spec.mtu < 1280 {
                        (StatusCode::UNPROCESSABLE_ENTITY, "mtu too small").into_response()
                    } else {
                        StatusCode::NO_CONTENT.into_response()
                    }
                })
                .delete(|Path(_id): Path<String>| async { StatusCode::NO_CONTENT }),
            )
            .route(
                "/v1/meshes/:id/status",
                get(|Path(id): Path<Uuid>| async move {
                    let public_key = if id.is_nil() {
                        "not-a-key".to_string()
                    } else {
                        KeyPair::generate().public_key_base64()
                    };
                    Json(AgentStatus {
                        active: true,
                        peers: vec![AgentPeerStatus {
                            public_key,
                            endpoint: None,
                            allowed_ips: None,
                            last_handshake: None,
                            connected: Some(true),
                        }],
                    })
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn agent() -> HttpNodeAgent {
        HttpNodeAgent::new(Duration::from_millis(500), Duration::from_secs(2), "v1").unwrap()
    }

    #[tokio::test]
    async fn test_apply_remove_status() {
        let node = node(spawn_fake_agent().await);
        let agent = agent();
        let mesh_id = Uuid::new_v4();

        agent.apply(&node, mesh_id, &spec(1420)).await.unwrap();
        let status = agent.status(&node, mesh_id).await.unwrap();
        assert!(status.active);
        assert_eq!(status.connected_peers(), 1);
        agent.remove(&node, mesh_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_carries_reason() {
        let node = node(spawn_fake_agent().await);
        let err = agent().apply(&node, Uuid::new_v4(), &spec(1000)).await.unwrap_err();
        match err {
            Error::AgentRejected { node_id, reason } => {
                assert_eq!(node_id, "edge-1");
                assert_eq!(reason, "HTTP 422: mtu too small");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_status_with_bad_peer_key_is_rejected() {
        let node = node(spawn_fake_agent().await);
        let err = agent().status(&node, Uuid::nil()).await.unwrap_err();
        match err {
            Error::AgentRejected { reason, .. } => {
                assert!(reason.starts_with("invalid status payload"), "{}", reason);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_agent() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let node = node(format!("http://{}", addr));
        let err = agent().remove(&node, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::AgentUnreachable { .. }));
    }

    #[test]
    fn test_mesh_url() {
        let node = node("https://edge-1:7443".into());
        let id = Uuid::nil();
        assert_eq!(
            agent().mesh_url(&node, id),
            format!("https://edge-1:7443/v1/meshes/{}", id)
        );
        let bare = HttpNodeAgent::new(Duration::from_secs(1), Duration::from_secs(1), "/").unwrap();
        assert_eq!(bare.mesh_url(&node, id), format!("https://edge-1:7443/meshes/{}", id));
    }
}
