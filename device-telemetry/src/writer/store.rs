//! Time-series store seam and the InfluxDB v2 HTTP implementation.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use tracing::{debug, info, trace};
use url::Url;

use super::point::Point;
use crate::config::StoreConfig;
use crate::utils::http_client::build_store_client;
use crate::{Error, Result};

/// A sink for time-series points.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Write the points synchronously; an error means none are guaranteed
    /// to have been stored.
    async fn write(&self, points: &[Point]) -> Result<()>;

    /// Release the client. Called when the writer stops; a repeated call
    /// after a forced shutdown must be harmless.
    async fn close(&self) -> Result<()>;
}

/// Writes line protocol to `POST {address}/api/v2/write`, keeping any path
/// prefix on the address.
pub struct InfluxStore {
    client: Client,
    write_url: Url,
    token: String,
}

impl InfluxStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let write_url = write_url(config)?;
        let client = build_store_client(config.timeout)?;

        info!(
            endpoint = %write_url.origin().ascii_serialization(),
            org = %config.org,
            bucket = %config.bucket,
            "InfluxDB store configured"
        );

        Ok(Self {
            client,
            write_url,
            token: config.token.clone(),
        })
    }
}

fn write_url(config: &StoreConfig) -> Result<Url> {
    let mut url = Url::parse(&config.address)
        .map_err(|e| Error::config(format!("invalid store address {}: {}", config.address, e)))?;
    url.path_segments_mut()
        .map_err(|_| Error::config(format!("store address {} cannot be a base", config.address)))?
        .pop_if_empty()
        .extend(["api", "v2", "write"]);
    url.query_pairs_mut()
        .append_pair("org", &config.org)
        .append_pair("bucket", &config.bucket)
        .append_pair("precision", "ns");
    Ok(url)
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn write(&self, points: &[Point]) -> Result<()> {
        let body = points
            .iter()
            .filter_map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");
        if body.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(self.write_url.clone())
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if !self.token.is_empty() {
            request = request.header(header::AUTHORIZATION, format!("Token {}", self.token));
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT || status.is_success() {
            trace!(points = points.len(), "Points written");
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(Error::Store(format!("write returned {}: {}", status, text.trim())))
    }

    async fn close(&self) -> Result<()> {
        // reqwest pools connections per client; dropping the last handle
        // releases them, so there is nothing to flush here.
        debug!("InfluxDB store closed");
        Ok(())
    }
}
