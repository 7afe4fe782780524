//! NAT traversal endpoint resolution
//!
//! Relay credentials come from an external minting service. When that
//! service is unreachable we fall back to reflection-only servers; sessions
//! that need a relay will then fail to connect.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use duochat_config::IceServer;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("credential service returned status {0}")]
    Status(u16),
    #[error("credential service returned no servers")]
    Empty,
}

/// Source of relay/reflection endpoints
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IceServer>, CredentialError>;
}

#[derive(Debug, Deserialize)]
struct CredentialResponse {
    #[serde(rename = "iceServers", default)]
    ice_servers: Vec<WireIceServer>,
}

/// `urls` may be a single string or a list on the wire
#[derive(Debug, Deserialize)]
struct WireIceServer {
    urls: WireUrls,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireUrls {
    One(String),
    Many(Vec<String>),
}

impl From<WireIceServer> for IceServer {
    fn from(server: WireIceServer) -> Self {
        let urls = match server.urls {
            WireUrls::One(url) => vec![url],
            WireUrls::Many(urls) => urls,
        };
        IceServer {
            urls,
            username: server.username,
            credential: server.credential,
        }
    }
}

/// Fetches `{"iceServers": [...]}` from an HTTP endpoint
pub struct HttpCredentialSource {
    url: String,
    client: reqwest::Client,
}

impl HttpCredentialSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> Result<Vec<IceServer>, CredentialError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::Status(status.as_u16()));
        }
        let body: CredentialResponse = response.json().await?;
        parse_servers(body)
    }
}

fn parse_servers(body: CredentialResponse) -> Result<Vec<IceServer>, CredentialError> {
    let servers: Vec<IceServer> = body
        .ice_servers
        .into_iter()
        .map(IceServer::from)
        .filter(|s| !s.urls.is_empty())
        .collect();
    if servers.is_empty() {
        return Err(CredentialError::Empty);
    }
    Ok(servers)
}

/// Query the source once, falling back to the static list on any failure
pub async fn resolve_ice_servers(
    source: Option<&dyn CredentialSource>,
    fallback: &[IceServer],
) -> Vec<IceServer> {
    let Some(source) = source else {
        return fallback.to_vec();
    };
    match source.fetch().await {
        Ok(servers) => {
            debug!(count = servers.len(), "fetched relay credentials");
            servers
        }
        Err(e) => {
            warn!(error = %e, "relay credentials unavailable, using reflection-only servers");
            fallback.to_vec()
        }
    }
}
