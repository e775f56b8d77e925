use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::SnackError;
use crate::model::SnackFile;

pub const DEFAULT_SDK_VERSION: &str = "26.0.0";
pub const DEFAULT_HOST: &str = "snack.expo.io";

const MIN_CHANNEL_LENGTH: usize = 6;

/// Callback invoked when a dependency cannot be resolved and the CDN
/// probe confirms it is genuinely unavailable.
pub type DependencyErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Options recognized at session construction.
#[derive(Clone)]
pub struct SessionOptions {
    pub files: HashMap<String, SnackFile>,
    pub sdk_version: Option<String>,
    pub verbose: bool,
    /// Channel identifier, fixed for the session lifetime. Defaults to a
    /// fresh random id; must be at least six characters.
    pub session_id: Option<String>,
    /// Editor host used when constructing shareable URLs.
    pub host: Option<String>,
    pub snack_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub dependencies: BTreeMap<String, String>,
    pub authorization_token: Option<String>,
    pub services: ServiceConfig,
    pub on_dependency_error: Option<DependencyErrorCallback>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            files: HashMap::new(),
            sdk_version: None,
            verbose: false,
            session_id: None,
            host: None,
            snack_id: None,
            name: None,
            description: None,
            dependencies: BTreeMap::new(),
            authorization_token: None,
            services: ServiceConfig::default(),
            on_dependency_error: None,
        }
    }
}

impl SessionOptions {
    pub fn with_files(files: HashMap<String, SnackFile>) -> Self {
        Self {
            files,
            ..Self::default()
        }
    }

    /// Resolve the channel id, generating one when absent, and enforce
    /// the minimum length the presence protocol needs.
    pub(crate) fn channel(&self) -> Result<String, SnackError> {
        let channel = match &self.session_id {
            Some(id) => id.clone(),
            None => Uuid::new_v4().simple().to_string(),
        };
        if channel.len() < MIN_CHANNEL_LENGTH {
            return Err(SnackError::InvalidConfig(format!(
                "session id must be at least {MIN_CHANNEL_LENGTH} characters, got {}",
                channel.len()
            )));
        }
        Ok(channel)
    }
}

/// External service endpoints. Production defaults; overridable for tests.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub api_url: String,
    pub snackager_url: String,
    pub cdn_url: String,
    /// Canonical object-store prefix; file contents starting with this are
    /// treated as already-uploaded references.
    pub s3_url_prefix: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_url: "https://expo.io".into(),
            snackager_url: "https://snackager.expo.io".into(),
            cdn_url: "https://d37p21p3n8r8ug.cloudfront.net".into(),
            s3_url_prefix: "https://s3-us-west-1.amazonaws.com/snack-code-uploads".into(),
        }
    }
}

impl ServiceConfig {
    pub fn save_url(&self) -> String {
        format!("{}/--/api/v2/snack/save", self.api_url)
    }

    pub fn upload_code_url(&self) -> String {
        format!("{}/--/api/v2/snack/uploadCode", self.api_url)
    }

    pub fn upload_asset_url(&self) -> String {
        format!("{}/--/api/v2/snack/upload", self.api_url)
    }

    pub fn download_url(&self, snack_id: &str) -> String {
        format!("{}/--/api/v2/snack/download/{snack_id}", self.api_url)
    }

    pub fn bundle_url(&self, name: &str, version: Option<&str>) -> String {
        match version {
            Some(version) => format!(
                "{}/bundle/{name}@{version}?platforms=ios,android",
                self.snackager_url
            ),
            None => format!("{}/bundle/{name}?platforms=ios,android", self.snackager_url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_channel_is_long_enough() {
        let options = SessionOptions::default();
        let channel = options.channel().unwrap();
        assert!(channel.len() >= MIN_CHANNEL_LENGTH);
    }

    #[test]
    fn short_session_id_is_rejected() {
        let options = SessionOptions {
            session_id: Some("abc".into()),
            ..SessionOptions::default()
        };
        assert!(matches!(
            options.channel(),
            Err(SnackError::InvalidConfig(_))
        ));
    }

    #[test]
    fn explicit_session_id_is_kept() {
        let options = SessionOptions {
            session_id: Some("abc123".into()),
            ..SessionOptions::default()
        };
        assert_eq!(options.channel().unwrap(), "abc123");
    }

    #[test]
    fn bundle_url_includes_version_when_pinned() {
        let services = ServiceConfig::default();
        assert_eq!(
            services.bundle_url("lodash", Some("4.17.21")),
            "https://snackager.expo.io/bundle/lodash@4.17.21?platforms=ios,android"
        );
        assert_eq!(
            services.bundle_url("lodash", None),
            "https://snackager.expo.io/bundle/lodash?platforms=ios,android"
        );
    }
}
