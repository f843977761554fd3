//! Pinecone vector index client.
//!
//! Only the two calls the worker needs: describing an index through the
//! control plane (to find its data-plane host and dimension) and upserting
//! vectors on the data plane.

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::capabilities::{VectorIndex, VectorRecord};
use crate::config::PineconeConfig;
use crate::error::{IndexError, ServiceError, ServiceResult};

/// Pinecone data-plane client bound to one index
pub struct PineconeClient {
    client: Client,
    api_key: String,
    api_version: String,
    host_url: String,
    namespace: Option<String>,
}

/// Index description returned by the control plane
#[derive(Debug, Clone, Deserialize)]
pub struct IndexDescription {
    pub name: String,
    pub dimension: usize,
    pub host: String,
    #[serde(default)]
    pub metric: Option<String>,
}

impl PineconeClient {
    /// Build a client for the configured index.
    ///
    /// Uses `index_host` when set; otherwise asks the control plane for the
    /// host and checks that the index dimension matches `dimensions`.
    pub async fn connect(config: &PineconeConfig, dimensions: usize) -> ServiceResult<Self> {
        let api_key = required(config.api_key.as_deref(), "pinecone.api_key")?;
        let index_name = required(config.index_name.as_deref(), "pinecone.index_name")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::Index(IndexError::Connection {
                    url: config.control_plane_url.clone(),
                    source: e,
                })
            })?;

        let host = match config.index_host.as_deref() {
            Some(host) if !host.trim().is_empty() => host.to_string(),
            _ => {
                let description = describe_index(
                    &client,
                    &config.control_plane_url,
                    api_key,
                    &config.api_version,
                    index_name,
                )
                .await?;

                if description.dimension != dimensions {
                    return Err(ServiceError::Config {
                        message: format!(
                            "Pinecone index {} has dimension {}, embeddings.dimensions is {}",
                            description.name, description.dimension, dimensions
                        ),
                    });
                }

                debug!(
                    index = %description.name,
                    host = %description.host,
                    metric = ?description.metric,
                    "Resolved Pinecone index host"
                );
                description.host
            }
        };

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            api_version: config.api_version.clone(),
            host_url: host_url(&host),
            namespace: config.namespace.clone().filter(|ns| !ns.is_empty()),
        })
    }

    pub fn host_url(&self) -> &str {
        &self.host_url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", &self.api_version)
    }
}

impl VectorIndex for PineconeClient {
    async fn upsert(&self, record: VectorRecord) -> ServiceResult<()> {
        let url = format!("{}/vectors/upsert", self.host_url);
        let id = record.id.clone();

        let request = UpsertRequest {
            vectors: vec![record],
            namespace: self.namespace.as_deref(),
        };

        let response = self
            .authorized(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| IndexError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(IndexError::Request { status, message }.into());
        }

        let upserted: UpsertResponse = response
            .json()
            .await
            .map_err(|e| IndexError::InvalidResponse { source: e })?;

        debug!(id = %id, upserted = upserted.upserted_count, "Upserted vector");
        Ok(())
    }
}

async fn describe_index(
    client: &Client,
    control_plane_url: &str,
    api_key: &str,
    api_version: &str,
    index_name: &str,
) -> ServiceResult<IndexDescription> {
    let url = format!(
        "{}/indexes/{}",
        control_plane_url.trim_end_matches('/'),
        index_name
    );

    let response = client
        .get(&url)
        .header("Api-Key", api_key)
        .header("X-Pinecone-API-Version", api_version)
        .send()
        .await
        .map_err(|e| IndexError::Connection {
            url: url.clone(),
            source: e,
        })?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(IndexError::IndexNotFound {
            name: index_name.to_string(),
        }
        .into());
    }

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        return Err(IndexError::Request { status, message }.into());
    }

    response
        .json()
        .await
        .map_err(|e| IndexError::InvalidResponse { source: e }.into())
}

fn required<'a>(value: Option<&'a str>, key: &str) -> ServiceResult<&'a str> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ServiceError::Config {
            message: format!("Missing required settings: {}", key),
        })
}

/// Pinecone reports bare hostnames; accept full URLs too
fn host_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

// Pinecone API types

#[derive(Debug, Serialize)]
struct UpsertRequest<'a> {
    vectors: Vec<VectorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertResponse {
    #[serde(default)]
    upserted_count: u64,
}
