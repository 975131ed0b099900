//! Update-graph (Cincinnati) client.
//!
//! Resolves the platform channels of the image-set config into concrete
//! release payload references by querying the update-graph service, and
//! fetches the graph-data tarball used to build the synthetic graph image.

use reqwest::Client;
use semver::Version;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::PlatformConfig;
use crate::constants::HTTP_REQUEST_TIMEOUT;
use crate::error::{Error, Result};

/// Default update-graph endpoint.
const DEFAULT_GRAPH_ENDPOINT: &str = "https://api.openshift.com/api/upgrades_info/v1/graph";

/// Default graph-data tarball location.
const DEFAULT_GRAPH_DATA_URL: &str = "https://api.openshift.com/api/upgrades_info/graph-data";

/// Architecture the payloads are resolved for.
const GRAPH_ARCH: &str = "amd64";

/// One resolved release payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseReference {
    /// Payload image reference (registry form, digest-pinned).
    pub source: String,
    /// Release version string.
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    #[serde(default)]
    nodes: Vec<GraphNode>,
}

#[derive(Debug, Deserialize)]
struct GraphNode {
    version: String,
    payload: String,
}

/// Update-graph HTTP client.
pub struct CincinnatiClient {
    http: Client,
    graph_endpoint: String,
    graph_data_url: String,
}

impl CincinnatiClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::RegistryRequest {
                reference: DEFAULT_GRAPH_ENDPOINT.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            http,
            graph_endpoint: DEFAULT_GRAPH_ENDPOINT.to_string(),
            graph_data_url: DEFAULT_GRAPH_DATA_URL.to_string(),
        })
    }

    /// Overrides the service endpoints (used by tests).
    pub fn with_endpoints(graph_endpoint: String, graph_data_url: String) -> Result<Self> {
        let mut client = Self::new()?;
        client.graph_endpoint = graph_endpoint;
        client.graph_data_url = graph_data_url;
        Ok(client)
    }

    /// Resolves every configured channel into payload references.
    ///
    /// With min/max bounds the whole reachable range is returned; without
    /// bounds only the newest release of the channel.
    pub async fn release_reference_images(
        &self,
        platform: &PlatformConfig,
    ) -> Result<Vec<ReleaseReference>> {
        let mut out = Vec::new();
        for channel in &platform.channels {
            let nodes = self.channel_nodes(&channel.name).await?;
            let min = parse_bound(channel.min_version.as_deref())?;
            let max = parse_bound(channel.max_version.as_deref())?;

            let mut matching: Vec<(Version, &GraphNode)> = nodes
                .iter()
                .filter_map(|n| {
                    let version = Version::parse(n.version.trim_start_matches('v')).ok()?;
                    let above = min.as_ref().map(|m| version >= *m).unwrap_or(true);
                    let below = max.as_ref().map(|m| version <= *m).unwrap_or(true);
                    (above && below).then_some((version, n))
                })
                .collect();
            matching.sort_by(|a, b| a.0.cmp(&b.0));

            if min.is_none() && max.is_none() {
                // No bounds: newest release only.
                if let Some((_, node)) = matching.last() {
                    out.push(ReleaseReference {
                        source: node.payload.clone(),
                        version: node.version.clone(),
                    });
                }
            } else {
                for (_, node) in matching {
                    out.push(ReleaseReference {
                        source: node.payload.clone(),
                        version: node.version.clone(),
                    });
                }
            }
        }
        info!("update graph resolved {} release payload(s)", out.len());
        Ok(out)
    }

    async fn channel_nodes(&self, channel: &str) -> Result<Vec<GraphNode>> {
        debug!("querying update graph channel {}", channel);
        let response = self
            .http
            .get(&self.graph_endpoint)
            .query(&[("channel", channel), ("arch", GRAPH_ARCH)])
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| Error::RegistryRequest {
                reference: self.graph_endpoint.clone(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Error::RegistryRequest {
                reference: self.graph_endpoint.clone(),
                reason: format!("graph query for '{}' returned {}", channel, response.status()),
            });
        }
        let graph: GraphResponse = response.json().await.map_err(|e| Error::Format {
            context: self.graph_endpoint.clone(),
            reason: e.to_string(),
        })?;
        Ok(graph.nodes)
    }

    /// Fetches the graph-data tarball for the synthetic graph image.
    pub async fn graph_data(&self) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(&self.graph_data_url)
            .send()
            .await
            .map_err(|e| Error::RegistryRequest {
                reference: self.graph_data_url.clone(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Error::RegistryRequest {
                reference: self.graph_data_url.clone(),
                reason: format!("graph data fetch returned {}", response.status()),
            });
        }
        Ok(response
            .bytes()
            .await
            .map_err(|e| Error::RegistryRequest {
                reference: self.graph_data_url.clone(),
                reason: e.to_string(),
            })?
            .to_vec())
    }
}

fn parse_bound(bound: Option<&str>) -> Result<Option<Version>> {
    match bound {
        None => Ok(None),
        Some(raw) => Version::parse(raw.trim_start_matches('v'))
            .map(Some)
            .map_err(|e| Error::Validation(format!("bad version bound '{}': {}", raw, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bound() {
        assert_eq!(parse_bound(None).unwrap(), None);
        assert_eq!(
            parse_bound(Some("4.15.2")).unwrap(),
            Some(Version::new(4, 15, 2))
        );
        assert!(parse_bound(Some("not-a-version")).is_err());
    }
}
