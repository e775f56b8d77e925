use std::collections::{BTreeMap, HashMap};

/// One entry in the session's file map. Code files hold source text;
/// assets hold either a raw blob awaiting upload or the object-store URL
/// that replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnackFile {
    Code(String),
    Asset(AssetSource),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    Blob { name: String, data: Vec<u8> },
    Url(String),
}

impl SnackFile {
    pub fn code(contents: impl Into<String>) -> Self {
        SnackFile::Code(contents.into())
    }

    pub fn asset_url(url: impl Into<String>) -> Self {
        SnackFile::Asset(AssetSource::Url(url.into()))
    }

    pub fn asset_blob(name: impl Into<String>, data: Vec<u8>) -> Self {
        SnackFile::Asset(AssetSource::Blob {
            name: name.into(),
            data,
        })
    }

    pub fn as_code(&self) -> Option<&str> {
        match self {
            SnackFile::Code(contents) => Some(contents),
            SnackFile::Asset(_) => None,
        }
    }
}

/// The metadata tuple captured at construction and after each successful
/// save; `is_saved` compares the live state against it.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedSnapshot {
    pub files: HashMap<String, SnackFile>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub dependencies: BTreeMap<String, String>,
    pub sdk_version: String,
}

/// Point-in-time view of the session handed to state listeners and
/// returned by `get_state`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub files: HashMap<String, SnackFile>,
    pub dependencies: BTreeMap<String, String>,
    pub sdk_version: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub channel: String,
    pub is_saved: bool,
    pub is_resolving: bool,
    pub loading_message: Option<String>,
}
