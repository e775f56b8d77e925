use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;
use crate::error::SnackError;
use crate::model::{AssetSource, SnackFile};

/// REST surface of the save/download service plus the object store used
/// for spilled code and uploaded assets.
#[async_trait]
pub trait ApiBackend: Send + Sync {
    async fn save(
        &self,
        request: &SaveRequest,
        authorization_token: Option<&str>,
    ) -> Result<SaveResponse, SnackError>;

    /// Upload code contents to the object store; returns the
    /// content-addressed URL.
    async fn upload_code(&self, contents: &str) -> Result<String, SnackError>;

    /// Upload an asset blob; returns its URL.
    async fn upload_asset(&self, filename: &str, data: Vec<u8>) -> Result<String, SnackError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveRequest {
    pub manifest: SaveManifest,
    pub code: BTreeMap<String, SavedFile>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveManifest {
    pub sdk_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Included only when the SDK supports project dependencies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedFile {
    #[serde(rename = "type")]
    pub kind: String,
    pub contents: String,
}

impl SavedFile {
    /// Wire form of a file map entry. Asset blobs have no wire form; they
    /// are uploaded and replaced by URLs before saving.
    pub fn from_file(file: &SnackFile) -> Option<SavedFile> {
        match file {
            SnackFile::Code(contents) => Some(SavedFile {
                kind: "CODE".into(),
                contents: contents.clone(),
            }),
            SnackFile::Asset(AssetSource::Url(url)) => Some(SavedFile {
                kind: "ASSET".into(),
                contents: url.clone(),
            }),
            SnackFile::Asset(AssetSource::Blob { .. }) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveResponse {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

pub struct HttpApiBackend {
    client: reqwest::Client,
    services: ServiceConfig,
}

impl HttpApiBackend {
    pub fn new(services: ServiceConfig) -> Result<Self, SnackError> {
        url::Url::parse(&services.api_url)
            .map_err(|err| SnackError::InvalidConfig(format!("invalid api url: {err}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, services })
    }
}

#[async_trait]
impl ApiBackend for HttpApiBackend {
    async fn save(
        &self,
        request: &SaveRequest,
        authorization_token: Option<&str>,
    ) -> Result<SaveResponse, SnackError> {
        let mut builder = self.client.post(self.services.save_url()).json(request);
        if let Some(token) = authorization_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(SnackError::HttpStatus(response.status()));
        }
        Ok(response.json::<SaveResponse>().await?)
    }

    async fn upload_code(&self, contents: &str) -> Result<String, SnackError> {
        let response = self
            .client
            .post(self.services.upload_code_url())
            .json(&serde_json::json!({ "code": contents }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SnackError::HttpStatus(response.status()));
        }
        Ok(response.json::<UploadResponse>().await?.url)
    }

    async fn upload_asset(&self, filename: &str, data: Vec<u8>) -> Result<String, SnackError> {
        let part = reqwest::multipart::Part::bytes(data).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("asset", part);
        let response = self
            .client
            .post(self.services.upload_asset_url())
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SnackError::HttpStatus(response.status()));
        }
        Ok(response.json::<UploadResponse>().await?.url)
    }
}
