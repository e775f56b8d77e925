use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelopes the host publishes on the session channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum HostMessage {
    #[serde(rename = "CODE")]
    Code {
        /// Legacy single-file payload, sent when the SDK predates
        /// multi-file publication.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<BTreeMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "s3url")]
        s3_url: Option<BTreeMap<String, String>>,
        metadata: RuntimeMetadata,
    },
    #[serde(rename = "LOADING_MESSAGE")]
    LoadingMessage { message: String },
}

/// Envelopes devices publish back to the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DeviceMessage {
    #[serde(rename = "CONSOLE")]
    Console {
        device: Device,
        method: String,
        #[serde(default)]
        payload: Vec<Value>,
    },
    #[serde(rename = "ERROR")]
    Error {
        /// JSON-encoded error body; see [`DeviceError`].
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<Device>,
    },
    #[serde(rename = "RESEND_CODE")]
    ResendCode,
}

/// Descriptor a device announces as its presence identifier, JSON-encoded.
/// Presence uuids that do not decode to this shape are not devices and are
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub platform: String,
}

impl Device {
    pub fn from_presence_uuid(uuid: &str) -> Option<Device> {
        serde_json::from_str(uuid).ok()
    }
}

/// Decoded body of a [`DeviceMessage::Error`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<ErrorLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// Analytics record attached to every code publish. Every probe field is
/// best-effort; absence is silent and never blocks publication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeMetadata {
    pub expo_sdk_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_architecture: Option<String>,
}

impl RuntimeMetadata {
    pub fn detect(sdk_version: &str) -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok()
            .filter(|name| !name.is_empty());
        Self {
            expo_sdk_version: sdk_version.to_string(),
            hostname,
            os_family: Some(std::env::consts::OS.to_string()).filter(|os| !os.is_empty()),
            os_version: detect_os_version(),
            os_architecture: Some(std::env::consts::ARCH.to_string()).filter(|a| !a.is_empty()),
        }
    }
}

fn detect_os_version() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .ok()
        .map(|version| version.trim().to_string())
        .filter(|version| !version.is_empty())
}
