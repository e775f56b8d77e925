use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::ApiBackend;
use crate::diff;
use crate::model::{AssetSource, SnackFile};
use crate::protocol::{HostMessage, RuntimeMetadata};
use crate::transport::SessionTransport;

/// Hard ceiling the transport imposes on a single publish.
pub const MAX_PUBLISH_PAYLOAD_BYTES: usize = 31_500;

/// Trailing debounce applied to edit-driven publishes.
pub const PUBLISH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Per-file publication bookkeeping, disjoint from the session's file
/// map. For every key either `diff` reconstructs the file from empty, or
/// `s3_url` holds the object-store reference and `s3_code` the contents
/// captured when that URL was minted.
#[derive(Default)]
struct Ledger {
    s3_code: HashMap<String, String>,
    s3_url: HashMap<String, String>,
    diff: HashMap<String, String>,
}

impl Ledger {
    fn prune_removed(&mut self, files: &HashMap<String, SnackFile>) {
        self.s3_code.retain(|key, _| files.contains_key(key));
        self.s3_url.retain(|key, _| files.contains_key(key));
        self.diff.retain(|key, _| files.contains_key(key));
    }
}

/// Builds, sizes, spills, and publishes code snapshots. Publishes are
/// serialized behind one lock so a debounced publish and an immediate one
/// never interleave a half-built snapshot.
pub struct Pipeline {
    api: Arc<dyn ApiBackend>,
    transport: Arc<SessionTransport>,
    channel: String,
    s3_url_prefix: String,
    verbose: bool,
    ledger: Mutex<Ledger>,
    publish_lock: Mutex<()>,
    debounce_generation: AtomicU64,
}

impl Pipeline {
    pub fn new(
        api: Arc<dyn ApiBackend>,
        transport: Arc<SessionTransport>,
        channel: String,
        s3_url_prefix: String,
        verbose: bool,
    ) -> Self {
        Self {
            api,
            transport,
            channel,
            s3_url_prefix,
            verbose,
            ledger: Mutex::new(Ledger::default()),
            publish_lock: Mutex::new(()),
            debounce_generation: AtomicU64::new(0),
        }
    }

    /// Invalidate any pending debounced publish and return the ticket the
    /// new one must present when it fires.
    pub fn next_debounce_ticket(&self) -> u64 {
        self.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn debounce_ticket_is_current(&self, ticket: u64) -> bool {
        self.debounce_generation.load(Ordering::SeqCst) == ticket
    }

    /// Drop object-store references so the next publish re-spills.
    pub async fn clear_spill_urls(&self) {
        self.ledger.lock().await.s3_url.clear();
    }

    pub async fn publish_loading(&self, message: &str) {
        let _serialized = self.publish_lock.lock().await;
        let envelope = HostMessage::LoadingMessage {
            message: message.to_string(),
        };
        if let Err(err) = self.transport.publish(&self.channel, &envelope).await {
            self.log_publish_failure("loading message", &err);
        }
    }

    /// Publish the current bundle. With `multiple_files` the payload is a
    /// `{diff, s3url}` map built through the ledger; otherwise the legacy
    /// single-file `code` payload is sent and the ledger is untouched.
    pub async fn publish_code(
        &self,
        files: &HashMap<String, SnackFile>,
        metadata: RuntimeMetadata,
        multiple_files: bool,
    ) {
        let _serialized = self.publish_lock.lock().await;

        let envelope = if multiple_files {
            let (diff_map, url_map) = self.build_snapshot(files, &metadata).await;
            HostMessage::Code {
                code: None,
                diff: Some(diff_map),
                s3_url: Some(url_map),
                metadata,
            }
        } else {
            let code = files
                .get("app.js")
                .and_then(SnackFile::as_code)
                .unwrap_or_default()
                .to_string();
            HostMessage::Code {
                code: Some(code),
                diff: None,
                s3_url: None,
                metadata,
            }
        };

        match self.transport.publish(&self.channel, &envelope).await {
            Ok(()) => {
                if self.verbose {
                    info!(channel = %self.channel, "published code");
                } else {
                    debug!(channel = %self.channel, "published code");
                }
            }
            Err(err) => self.log_publish_failure("code", &err),
        }
    }

    /// Populate the ledger for every live key, then spill largest-first
    /// until the estimated payload fits the transport bound.
    async fn build_snapshot(
        &self,
        files: &HashMap<String, SnackFile>,
        metadata: &RuntimeMetadata,
    ) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let mut ledger = self.ledger.lock().await;
        ledger.prune_removed(files);

        let mut keys: Vec<&String> = files.keys().collect();
        keys.sort();

        for key in &keys {
            match &files[*key] {
                SnackFile::Asset(AssetSource::Blob { name, data }) => {
                    match self.api.upload_asset(name, data.clone()).await {
                        Ok(url) => {
                            ledger.s3_code.remove(*key);
                            ledger.s3_url.insert((*key).clone(), url);
                            ledger.diff.insert((*key).clone(), String::new());
                        }
                        Err(err) => {
                            warn!(key = %key, error = %err, "asset upload failed; omitting from publish");
                            ledger.diff.remove(*key);
                            ledger.s3_url.remove(*key);
                        }
                    }
                }
                SnackFile::Asset(AssetSource::Url(url)) => {
                    ledger.s3_code.remove(*key);
                    ledger.s3_url.insert((*key).clone(), url.clone());
                    ledger.diff.insert((*key).clone(), String::new());
                }
                SnackFile::Code(contents) if contents.starts_with(&self.s3_url_prefix) => {
                    // Already an object-store reference; no diffing needed.
                    ledger.s3_code.insert((*key).clone(), contents.clone());
                    ledger.s3_url.insert((*key).clone(), contents.clone());
                    ledger.diff.insert((*key).clone(), String::new());
                }
                SnackFile::Code(contents) => {
                    let anchor = if ledger.s3_url.contains_key(*key) {
                        ledger.s3_code.get(*key).cloned().unwrap_or_default()
                    } else {
                        String::new()
                    };
                    ledger
                        .diff
                        .insert((*key).clone(), diff::diff(&anchor, contents));
                }
            }
        }

        loop {
            let envelope = snapshot_message(&ledger, metadata);
            let size = diff::payload_size(&self.channel, &envelope);
            if size <= MAX_PUBLISH_PAYLOAD_BYTES {
                break;
            }

            // Largest remaining inline file first; ties broken by key
            // order for determinism.
            let candidate = keys
                .iter()
                .filter_map(|key| {
                    let contents = files[*key].as_code()?;
                    let pending = ledger.diff.get(*key).map(|d| !d.is_empty()).unwrap_or(false);
                    pending.then_some(((*key).clone(), contents.to_string()))
                })
                .max_by(|(key_a, a), (key_b, b)| {
                    a.len().cmp(&b.len()).then(key_b.cmp(key_a))
                });

            let Some((key, contents)) = candidate else {
                warn!(
                    size,
                    limit = MAX_PUBLISH_PAYLOAD_BYTES,
                    "payload oversize with no spill candidates left"
                );
                break;
            };

            match self.api.upload_code(&contents).await {
                Ok(url) => {
                    debug!(key = %key, bytes = contents.len(), "spilled file to object store");
                    ledger.s3_code.insert(key.clone(), contents);
                    ledger.s3_url.insert(key.clone(), url);
                    ledger.diff.insert(key, String::new());
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "spill upload failed; publishing oversize");
                    break;
                }
            }
        }

        let diff_map: BTreeMap<String, String> = ledger
            .diff
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let url_map: BTreeMap<String, String> = ledger
            .s3_url
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        (diff_map, url_map)
    }

    fn log_publish_failure(&self, kind: &str, err: &anyhow::Error) {
        if self.verbose {
            info!(kind, error = %err, "publish failed");
        } else {
            debug!(kind, error = %err, "publish failed");
        }
    }
}

fn snapshot_message(ledger: &Ledger, metadata: &RuntimeMetadata) -> serde_json::Value {
    let message = HostMessage::Code {
        code: None,
        diff: Some(ledger.diff.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        s3_url: Some(ledger.s3_url.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        metadata: metadata.clone(),
    };
    serde_json::to_value(message).unwrap_or_default()
}
