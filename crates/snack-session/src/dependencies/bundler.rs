use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::ServiceConfig;
use crate::diff::encode_uri_component;
use crate::error::SnackError;

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_POLL_ATTEMPTS: u32 = 30;
pub const PLATFORMS: &[&str] = &["ios", "android"];

/// One poll of the bundler: either still building or a terminal manifest.
#[derive(Debug, Clone, PartialEq)]
pub enum BundleResponse {
    Pending,
    Ready(BundleManifest),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BundleManifest {
    pub name: String,
    pub version: String,
    /// Peer dependencies the bundle expects the host bundle to provide.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

#[async_trait]
pub trait BundlerClient: Send + Sync {
    async fn fetch_bundle(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<BundleResponse, SnackError>;

    /// Whether the CDN mirror holds a finished bundle for the platform.
    async fn cdn_has_bundle(
        &self,
        name: &str,
        version: &str,
        platform: &str,
    ) -> Result<bool, SnackError>;
}

/// Poll the bundler until the bundle is ready, waiting [`POLL_INTERVAL`]
/// between attempts and giving up after [`MAX_POLL_ATTEMPTS`].
pub async fn poll_bundle(
    client: &dyn BundlerClient,
    name: &str,
    version: Option<&str>,
) -> Result<BundleManifest, SnackError> {
    for attempt in 0..MAX_POLL_ATTEMPTS {
        match client.fetch_bundle(name, version).await? {
            BundleResponse::Ready(manifest) => return Ok(manifest),
            BundleResponse::Pending => {
                debug!(name, attempt, "bundle pending");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
    Err(SnackError::BundlerTimeout {
        name: name.to_string(),
        attempts: MAX_POLL_ATTEMPTS,
    })
}

/// Probe path for a finished bundle on the CDN mirror. Scoped-package
/// slashes are rewritten to `~` before encoding, matching the bundler's
/// upload layout.
pub fn cdn_probe_url(services: &ServiceConfig, name: &str, version: &str, platform: &str) -> String {
    let hash = format!("{}@{}", name.replace('/', "~"), version);
    format!(
        "{}/{}-{platform}/.done",
        services.cdn_url,
        encode_uri_component(&hash)
    )
}

pub struct HttpBundlerClient {
    client: reqwest::Client,
    services: ServiceConfig,
}

impl HttpBundlerClient {
    pub fn new(services: ServiceConfig) -> Result<Self, SnackError> {
        url::Url::parse(&services.snackager_url)
            .map_err(|err| SnackError::InvalidConfig(format!("invalid bundler url: {err}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, services })
    }
}

#[async_trait]
impl BundlerClient for HttpBundlerClient {
    async fn fetch_bundle(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<BundleResponse, SnackError> {
        let url = self.services.bundle_url(name, version);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SnackError::HttpStatus(response.status()));
        }
        let value = response.json::<serde_json::Value>().await?;
        if value.get("pending").and_then(|p| p.as_bool()) == Some(true) {
            return Ok(BundleResponse::Pending);
        }
        let manifest = serde_json::from_value(value)
            .map_err(|err| SnackError::InvalidResponse(format!("bundle manifest: {err}")))?;
        Ok(BundleResponse::Ready(manifest))
    }

    async fn cdn_has_bundle(
        &self,
        name: &str,
        version: &str,
        platform: &str,
    ) -> Result<bool, SnackError> {
        let url = cdn_probe_url(&self.services, name, version, platform);
        let response = self.client.get(&url).send().await?;
        Ok(response.status().as_u16() < 400)
    }
}
