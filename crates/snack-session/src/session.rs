use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use snack_bus::{Bus, ChannelEvent, ConnectionStatus, PresenceAction, PresenceChange};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::api::{ApiBackend, HttpApiBackend, SaveManifest, SaveRequest, SaveResponse, SavedFile};
use crate::config::{DependencyErrorCallback, ServiceConfig, SessionOptions, DEFAULT_HOST, DEFAULT_SDK_VERSION};
use crate::dependencies::bundler::{BundlerClient, HttpBundlerClient};
use crate::dependencies::{self, Resolver};
use crate::error::SnackError;
use crate::features::{supports, SdkFeature};
use crate::listeners::{
    DeviceErrorEvent, DeviceLogEvent, DevicePresenceEvent, ListenerHandle, Listeners,
    PresenceStatus,
};
use crate::model::{AssetSource, SavedSnapshot, SessionState, SnackFile};
use crate::protocol::{Device, DeviceMessage, RuntimeMetadata};
use crate::publish::{Pipeline, PUBLISH_DEBOUNCE};
use crate::transport::SessionTransport;

const LOADING_DEPENDENCIES_MESSAGE: &str = "Installing dependencies";

/// A live coding session: the host-side owner of the file bundle, its
/// publication pipeline, and the device listeners.
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
}

struct MutableState {
    files: HashMap<String, SnackFile>,
    dependencies: BTreeMap<String, String>,
    sdk_version: String,
    name: Option<String>,
    description: Option<String>,
    loading_message: Option<String>,
    snack_id: Option<String>,
}

/// Clears the loading message when dropped, whichever path the
/// resolution takes out of scope.
struct LoadingGuard<'a> {
    state: &'a parking_lot::RwLock<MutableState>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.state.write().loading_message = None;
    }
}

struct SessionInner {
    channel: String,
    host: String,
    verbose: bool,
    authorization_token: Option<String>,
    services: ServiceConfig,
    api: Arc<dyn ApiBackend>,
    transport: Arc<SessionTransport>,
    pipeline: Pipeline,
    resolver: Resolver,
    listeners: Listeners,
    on_dependency_error: Option<DependencyErrorCallback>,
    state: parking_lot::RwLock<MutableState>,
    initial: parking_lot::Mutex<SavedSnapshot>,
    lifecycle: parking_lot::Mutex<Lifecycle>,
}

impl Session {
    /// Create a session against the production HTTP services, publishing
    /// over the supplied bus. Must be called inside a tokio runtime.
    pub fn new(options: SessionOptions, bus: Arc<dyn Bus>) -> Result<Session, SnackError> {
        let services = options.services.clone();
        let api = Arc::new(HttpApiBackend::new(services.clone())?);
        let bundler = Arc::new(HttpBundlerClient::new(services)?);
        Self::with_backends(options, bus, api, bundler)
    }

    /// Create a session with explicit service backends. This is the seam
    /// tests and embedders use to stub the object store and bundler.
    pub fn with_backends(
        options: SessionOptions,
        bus: Arc<dyn Bus>,
        api: Arc<dyn ApiBackend>,
        bundler: Arc<dyn BundlerClient>,
    ) -> Result<Session, SnackError> {
        let channel = options.channel()?;
        let sdk_version = options
            .sdk_version
            .clone()
            .unwrap_or_else(|| DEFAULT_SDK_VERSION.to_string());

        let state = MutableState {
            files: options.files.clone(),
            dependencies: options.dependencies.clone(),
            sdk_version: sdk_version.clone(),
            name: options.name.clone(),
            description: options.description.clone(),
            loading_message: None,
            snack_id: options.snack_id.clone(),
        };
        let initial = SavedSnapshot {
            files: state.files.clone(),
            name: state.name.clone(),
            description: state.description.clone(),
            dependencies: state.dependencies.clone(),
            sdk_version: sdk_version.clone(),
        };

        let transport = Arc::new(SessionTransport::new(bus));
        let pipeline = Pipeline::new(
            api.clone(),
            transport.clone(),
            channel.clone(),
            options.services.s3_url_prefix.clone(),
            options.verbose,
        );

        let inner = Arc::new(SessionInner {
            channel,
            host: options.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            verbose: options.verbose,
            authorization_token: options.authorization_token.clone(),
            services: options.services.clone(),
            api,
            transport,
            pipeline,
            resolver: Resolver::new(bundler),
            listeners: Listeners::default(),
            on_dependency_error: options.on_dependency_error.clone(),
            state: parking_lot::RwLock::new(state),
            initial: parking_lot::Mutex::new(initial),
            lifecycle: parking_lot::Mutex::new(Lifecycle::Created),
        });

        if supports(&sdk_version, SdkFeature::ArbitraryImports) {
            inner.spawn_resolution();
        }

        Ok(Session { inner })
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Subscribe to the session channel and begin handling device
    /// traffic. Idempotent after the first call.
    pub async fn start(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle != Lifecycle::Created {
                return;
            }
            *lifecycle = Lifecycle::Started;
        }
        if let Some(rx) = self.inner.transport.subscribe(&self.inner.channel, true) {
            tokio::spawn(event_loop(Arc::downgrade(&self.inner), rx));
        }
    }

    /// Unsubscribe and drop object-store references so a future publish
    /// re-spills everything.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle != Lifecycle::Started {
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }
        self.inner.transport.unsubscribe(&self.inner.channel);
        self.inner.pipeline.clear_spill_urls().await;
    }

    /// Replace the session's file map with `files`: keys missing from the
    /// input are deleted, changed keys overwritten, and asset blobs
    /// uploaded to the object store before the publish is scheduled.
    pub async fn send_code(
        &self,
        files: HashMap<String, SnackFile>,
    ) -> Result<(), SnackError> {
        let mut prepared = HashMap::with_capacity(files.len());
        for (key, file) in files {
            let file = match file {
                SnackFile::Asset(AssetSource::Blob { name, data }) => {
                    let url = self.inner.api.upload_asset(&name, data).await?;
                    SnackFile::Asset(AssetSource::Url(url))
                }
                other => other,
            };
            prepared.insert(key, file);
        }

        self.inner.state.write().files = prepared;
        self.inner.schedule_publish();
        self.inner.emit_state();
        Ok(())
    }

    pub fn set_sdk_version(&self, sdk_version: impl Into<String>) {
        self.inner.state.write().sdk_version = sdk_version.into();
        self.inner.emit_state();
        self.inner.spawn_resolution();
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.state.write().name = Some(name.into());
        self.inner.emit_state();
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.inner.state.write().description = Some(description.into());
        self.inner.emit_state();
    }

    pub fn get_state(&self) -> SessionState {
        self.inner.snapshot_state()
    }

    /// Persist the session through the save endpoint, record the returned
    /// id, and reset the saved-state snapshot.
    pub async fn save(&self) -> Result<SaveResponse, SnackError> {
        let request = {
            let state = self.inner.state.read();
            let include_dependencies = supports(&state.sdk_version, SdkFeature::ProjectDependencies)
                || !state.dependencies.is_empty();
            SaveRequest {
                manifest: SaveManifest {
                    sdk_version: state.sdk_version.clone(),
                    name: state.name.clone(),
                    description: state.description.clone(),
                    dependencies: include_dependencies.then(|| state.dependencies.clone()),
                },
                code: state
                    .files
                    .iter()
                    .filter_map(|(key, file)| {
                        SavedFile::from_file(file).map(|saved| (key.clone(), saved))
                    })
                    .collect(),
            }
        };

        let response = self
            .inner
            .api
            .save(&request, self.inner.authorization_token.as_deref())
            .await?;

        {
            let mut state = self.inner.state.write();
            state.snack_id = Some(response.id.clone());
            *self.inner.initial.lock() = SavedSnapshot {
                files: state.files.clone(),
                name: state.name.clone(),
                description: state.description.clone(),
                dependencies: state.dependencies.clone(),
                sdk_version: state.sdk_version.clone(),
            };
        }
        self.inner.emit_state();
        Ok(response)
    }

    /// Shareable URL: the saved snack when one exists, otherwise the
    /// live-channel experience URL devices use to join.
    pub fn url(&self) -> String {
        let state = self.inner.state.read();
        match &state.snack_id {
            Some(id) => format!("https://{}/{}", self.inner.host, id),
            None => format!(
                "exp://{}/@snack/sdk.{}-{}",
                self.inner.host, state.sdk_version, self.inner.channel
            ),
        }
    }

    /// Save if needed, then return the download endpoint for the saved
    /// snack.
    pub async fn download_url(&self) -> Result<String, SnackError> {
        let saved_id = self.inner.state.read().snack_id.clone();
        let id = match saved_id {
            Some(id) if self.inner.is_saved() => id,
            _ => self.save().await?.id,
        };
        Ok(self.inner.services.download_url(&id))
    }

    pub async fn upload_asset(
        &self,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<String, SnackError> {
        self.inner.api.upload_asset(filename, data).await
    }

    pub fn add_error_listener(
        &self,
        callback: impl Fn(&DeviceErrorEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.error.add(callback)
    }

    pub fn add_log_listener(
        &self,
        callback: impl Fn(&DeviceLogEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.log.add(callback)
    }

    pub fn add_presence_listener(
        &self,
        callback: impl Fn(&DevicePresenceEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.presence.add(callback)
    }

    pub fn add_state_listener(
        &self,
        callback: impl Fn(&SessionState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.state.add(callback)
    }
}

impl SessionInner {
    fn is_started(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Started
    }

    fn is_saved(&self) -> bool {
        let state = self.state.read();
        let current = SavedSnapshot {
            files: state.files.clone(),
            name: state.name.clone(),
            description: state.description.clone(),
            dependencies: state.dependencies.clone(),
            sdk_version: state.sdk_version.clone(),
        };
        current == *self.initial.lock()
    }

    fn snapshot_state(&self) -> SessionState {
        let is_saved = self.is_saved();
        let state = self.state.read();
        SessionState {
            files: state.files.clone(),
            dependencies: state.dependencies.clone(),
            sdk_version: state.sdk_version.clone(),
            name: state.name.clone(),
            description: state.description.clone(),
            channel: self.channel.clone(),
            is_saved,
            is_resolving: self.resolver.is_resolving(),
            loading_message: state.loading_message.clone(),
        }
    }

    fn emit_state(&self) {
        let snapshot = self.snapshot_state();
        self.listeners.state.dispatch(&snapshot);
    }

    /// Trailing-debounced publish: each call invalidates the previous
    /// pending one and arms a fresh 500 ms timer.
    fn schedule_publish(self: &Arc<Self>) {
        let ticket = self.pipeline.next_debounce_ticket();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(PUBLISH_DEBOUNCE).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.pipeline.debounce_ticket_is_current(ticket) {
                return;
            }
            inner.resolve_dependencies().await;
            inner.publish_now().await;
        });
    }

    /// Kick a dependency resolution without awaiting it. Outside a tokio
    /// runtime (plain construction in sync code) resolution waits for the
    /// first scheduled publish instead.
    fn spawn_resolution(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime at construction; deferring dependency resolution");
            return;
        };
        let weak = Arc::downgrade(self);
        handle.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.resolve_dependencies().await;
            }
        });
    }

    /// Undebounced publish. A pending loading message always wins; code
    /// publication is suppressed while a resolution is in flight and
    /// before the session is started.
    async fn publish_now(&self) {
        if !self.is_started() {
            return;
        }
        let loading_message = self.state.read().loading_message.clone();
        if let Some(message) = loading_message {
            self.pipeline.publish_loading(&message).await;
            return;
        }
        if self.resolver.is_resolving() {
            return;
        }

        let (files, sdk_version) = {
            let state = self.state.read();
            (state.files.clone(), state.sdk_version.clone())
        };
        let multiple_files = supports(&sdk_version, SdkFeature::MultipleFiles);
        let metadata = RuntimeMetadata::detect(&sdk_version);
        self.pipeline
            .publish_code(&files, metadata, multiple_files)
            .await;
    }

    /// Run the dependency engine once: scan, fetch, rewrite, commit.
    /// Re-entry while a resolution is in flight is a no-op. The resolving
    /// slot and the loading message are held by drop guards, so both are
    /// released on every exit path, panics included.
    async fn resolve_dependencies(&self) {
        let sdk_version = self.state.read().sdk_version.clone();
        if !supports(&sdk_version, SdkFeature::ArbitraryImports) {
            return;
        }
        let Some(resolution) = self.resolver.try_begin() else {
            return;
        };

        let plans = {
            let state = self.state.read();
            Resolver::plan(&state.files, &state.dependencies)
        };
        if plans.is_empty() {
            return;
        }

        self.state.write().loading_message = Some(LOADING_DEPENDENCIES_MESSAGE.to_string());
        let loading = LoadingGuard { state: &self.state };
        self.publish_now().await;

        let outcome = self.resolver.execute(plans).await;

        {
            let mut state = self.state.write();
            for update in &outcome.updates {
                // Discard the rewrite when the file changed mid-resolution.
                match state.files.get(&update.key) {
                    Some(SnackFile::Code(contents)) if *contents == update.anchor => {
                        state
                            .files
                            .insert(update.key.clone(), SnackFile::Code(update.code.clone()));
                    }
                    _ => {
                        debug!(key = %update.key, "file changed during resolution; dropping rewrite");
                    }
                }
            }
            for (name, version) in &outcome.pins {
                if !dependencies::is_reserved(name) {
                    state.dependencies.insert(name.clone(), version.clone());
                }
            }
        }
        // Settle both guards before listeners observe the session, so
        // the emitted state shows the resolution finished.
        drop(loading);
        drop(resolution);

        for unresolved in &outcome.unavailable {
            let message = unresolved
                .error
                .clone()
                .unwrap_or_else(|| format!("failed to resolve {}", unresolved.name));
            warn!(name = %unresolved.name, error = %message, "dependency unavailable");
            if let Some(callback) = &self.on_dependency_error {
                callback(&message);
            }
        }

        self.emit_state();
    }

    async fn handle_device_message(&self, message: DeviceMessage) {
        match message {
            DeviceMessage::Console {
                device,
                method,
                payload,
            } => {
                self.listeners.log.dispatch(&DeviceLogEvent {
                    device,
                    method,
                    payload,
                });
            }
            DeviceMessage::Error { error, device } => match serde_json::from_str(&error) {
                Ok(decoded) => {
                    self.listeners.error.dispatch(&DeviceErrorEvent {
                        error: decoded,
                        device,
                    });
                }
                Err(err) => {
                    if self.verbose {
                        warn!(error = %err, raw = %error, "undecodable device error");
                    }
                }
            },
            DeviceMessage::ResendCode => {
                debug!("device requested code resend");
                self.publish_now().await;
            }
        }
    }

    async fn handle_presence(&self, change: PresenceChange) {
        // Presence identifiers that are not device descriptors belong to
        // other editor tabs and the like; they never reach listeners.
        let Some(device) = Device::from_presence_uuid(&change.uuid) else {
            return;
        };
        match change.action {
            PresenceAction::Join => {
                self.listeners.presence.dispatch(&DevicePresenceEvent {
                    device,
                    status: PresenceStatus::Join,
                });
                // Late joiners get the current bundle without waiting out
                // the debounce interval.
                self.publish_now().await;
            }
            PresenceAction::Leave | PresenceAction::Timeout => {
                self.listeners.presence.dispatch(&DevicePresenceEvent {
                    device,
                    status: PresenceStatus::Leave,
                });
            }
        }
    }
}

async fn event_loop(weak: Weak<SessionInner>, mut rx: broadcast::Receiver<ChannelEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Message(payload) => {
                if let Some(message) = SessionTransport::decode_device_message(&payload) {
                    inner.handle_device_message(message).await;
                }
            }
            ChannelEvent::Presence(change) => inner.handle_presence(change).await,
            ChannelEvent::Status(ConnectionStatus::Reconnected) => {
                if inner.is_started() {
                    debug!("network back up; re-subscribing");
                    rx = inner.transport.resubscribe(&inner.channel, true);
                }
            }
            ChannelEvent::Status(_) => {}
        }
    }
}
