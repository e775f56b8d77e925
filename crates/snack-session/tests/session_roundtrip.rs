use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use snack_bus::{Bus, ChannelEvent, LocalBus};
use snack_session::api::{ApiBackend, SaveRequest, SaveResponse};
use snack_session::dependencies::bundler::{BundleManifest, BundleResponse, BundlerClient};
use snack_session::error::SnackError;
use snack_session::{Session, SessionOptions, SnackFile};
use tokio::sync::broadcast;

const CHANNEL: &str = "abc123";
const S3_PREFIX: &str = "https://s3-test/snack-code-uploads";
const DEVICE_UUID: &str = r#"{"id":"device-1","name":"iPhone","platform":"ios"}"#;

#[derive(Default)]
struct MockApi {
    code_uploads: AtomicUsize,
    asset_uploads: AtomicUsize,
    saves: Mutex<Vec<SaveRequest>>,
}

#[async_trait]
impl ApiBackend for MockApi {
    async fn save(
        &self,
        request: &SaveRequest,
        _authorization_token: Option<&str>,
    ) -> Result<SaveResponse, SnackError> {
        self.saves.lock().unwrap().push(request.clone());
        Ok(SaveResponse {
            id: "snack-id-1".into(),
            url: None,
        })
    }

    async fn upload_code(&self, contents: &str) -> Result<String, SnackError> {
        let n = self.code_uploads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{S3_PREFIX}/{n}-{}", contents.len()))
    }

    async fn upload_asset(&self, filename: &str, _data: Vec<u8>) -> Result<String, SnackError> {
        self.asset_uploads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{S3_PREFIX}/assets/{filename}"))
    }
}

#[derive(Default)]
struct MockBundler;

#[async_trait]
impl BundlerClient for MockBundler {
    async fn fetch_bundle(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<BundleResponse, SnackError> {
        Ok(BundleResponse::Ready(BundleManifest {
            name: name.to_string(),
            version: version.unwrap_or("1.0.0").to_string(),
            dependencies: BTreeMap::new(),
        }))
    }

    async fn cdn_has_bundle(
        &self,
        _name: &str,
        _version: &str,
        _platform: &str,
    ) -> Result<bool, SnackError> {
        Ok(false)
    }
}

struct Harness {
    session: Session,
    bus: Arc<LocalBus>,
    api: Arc<MockApi>,
    rx: broadcast::Receiver<ChannelEvent>,
}

fn harness(files: HashMap<String, SnackFile>) -> Harness {
    let bus = Arc::new(LocalBus::new());
    let rx = bus.subscribe(CHANNEL, false);
    let api = Arc::new(MockApi::default());
    let mut options = SessionOptions::with_files(files);
    options.session_id = Some(CHANNEL.to_string());
    options.services.s3_url_prefix = S3_PREFIX.to_string();
    let session = Session::with_backends(
        options,
        bus.clone(),
        api.clone(),
        Arc::new(MockBundler::default()),
    )
    .expect("session constructs");
    Harness {
        session,
        bus,
        api,
        rx,
    }
}

fn app_files(code: &str) -> HashMap<String, SnackFile> {
    HashMap::from([("app.js".to_string(), SnackFile::code(code))])
}

/// Next `CODE` envelope on the channel, skipping presence, loading, and
/// device-originated frames.
async fn next_code(rx: &mut broadcast::Receiver<ChannelEvent>) -> serde_json::Value {
    loop {
        if let ChannelEvent::Message(payload) = rx.recv().await.expect("channel open") {
            let value: serde_json::Value = serde_json::from_slice(&payload).expect("json");
            if value["type"] == "CODE" {
                return value;
            }
        }
    }
}

fn no_pending_message(rx: &mut broadcast::Receiver<ChannelEvent>) -> bool {
    loop {
        match rx.try_recv() {
            Ok(ChannelEvent::Message(_)) => return false,
            Ok(_) => continue,
            Err(broadcast::error::TryRecvError::Empty) => return true,
            Err(err) => panic!("channel error: {err}"),
        }
    }
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn small_bundle_publishes_inline_after_the_debounce() {
    let mut h = harness(HashMap::new());
    h.session.start().await;

    h.session
        .send_code(app_files("console.log(1)"))
        .await
        .expect("send ok");

    settle().await;
    assert!(
        no_pending_message(&mut h.rx),
        "nothing may publish before the debounce interval"
    );

    tokio::time::advance(Duration::from_millis(550)).await;
    let value = next_code(&mut h.rx).await;
    assert_eq!(value["diff"]["app.js"], snack_session::diff::diff("", "console.log(1)"));
    assert_eq!(value["s3url"], serde_json::json!({}));
    assert_eq!(value["metadata"]["expoSdkVersion"], "26.0.0");
    assert_eq!(h.api.code_uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn rapid_edits_collapse_into_one_publish() {
    let mut h = harness(HashMap::new());
    h.session.start().await;

    h.session.send_code(app_files("one()")).await.unwrap();
    tokio::time::advance(Duration::from_millis(300)).await;
    h.session.send_code(app_files("two()")).await.unwrap();
    tokio::time::advance(Duration::from_millis(300)).await;
    settle().await;
    assert!(
        no_pending_message(&mut h.rx),
        "the second edit must re-arm the debounce"
    );

    tokio::time::advance(Duration::from_millis(250)).await;
    let value = next_code(&mut h.rx).await;
    assert_eq!(value["diff"]["app.js"], snack_session::diff::diff("", "two()"));
    assert!(no_pending_message(&mut h.rx), "only one publish for both edits");
}

#[tokio::test(start_paused = true)]
async fn oversize_bundle_spills_to_object_storage() {
    let mut h = harness(HashMap::new());
    h.session.start().await;

    let big = "x".repeat(100_000);
    h.session
        .send_code(HashMap::from([
            ("a.js".to_string(), SnackFile::code(big)),
            ("b.js".to_string(), SnackFile::code("x")),
        ]))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_millis(550)).await;
    let value = next_code(&mut h.rx).await;
    assert_eq!(value["diff"]["a.js"], "");
    assert!(value["s3url"]["a.js"].as_str().unwrap().starts_with(S3_PREFIX));
    assert_eq!(value["diff"]["b.js"], snack_session::diff::diff("", "x"));
    assert_eq!(h.api.code_uploads.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn device_join_triggers_an_undebounced_publish() {
    let mut h = harness(app_files("console.log('hi')"));
    h.session.start().await;

    let joined = Arc::new(Mutex::new(Vec::new()));
    let _listener = {
        let joined = joined.clone();
        h.session.add_presence_listener(move |event| {
            joined.lock().unwrap().push((event.device.name.clone(), event.status));
        })
    };

    h.bus.announce_join(CHANNEL, DEVICE_UUID);
    let value = next_code(&mut h.rx).await;
    assert_eq!(
        value["diff"]["app.js"],
        snack_session::diff::diff("", "console.log('hi')")
    );
    assert_eq!(
        *joined.lock().unwrap(),
        vec![("iPhone".to_string(), snack_session::PresenceStatus::Join)]
    );
}

#[tokio::test(start_paused = true)]
async fn resend_request_publishes_immediately() {
    let mut h = harness(app_files("render()"));
    h.session.start().await;

    h.bus
        .publish(
            CHANNEL,
            bytes::Bytes::from(serde_json::json!({"type": "RESEND_CODE"}).to_string()),
        )
        .await
        .expect("device publish");

    let value = next_code(&mut h.rx).await;
    assert_eq!(value["diff"]["app.js"], snack_session::diff::diff("", "render()"));
}

#[tokio::test(start_paused = true)]
async fn non_device_presence_is_silently_ignored() {
    let mut h = harness(app_files("render()"));
    h.session.start().await;

    let presence_events = Arc::new(Mutex::new(0usize));
    let _listener = {
        let presence_events = presence_events.clone();
        h.session.add_presence_listener(move |_| {
            *presence_events.lock().unwrap() += 1;
        })
    };

    h.bus.announce_join(CHANNEL, "another-editor-tab");
    settle().await;
    assert_eq!(*presence_events.lock().unwrap(), 0);
    assert!(no_pending_message(&mut h.rx));

    h.bus.announce_join(CHANNEL, DEVICE_UUID);
    let _ = next_code(&mut h.rx).await;
    assert_eq!(*presence_events.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn device_console_and_error_traffic_reaches_listeners() {
    let h = harness(app_files("render()"));
    h.session.start().await;

    let logs = Arc::new(Mutex::new(Vec::new()));
    let _log_listener = {
        let logs = logs.clone();
        h.session.add_log_listener(move |event| {
            logs.lock().unwrap().push((event.method.clone(), event.payload.len()));
        })
    };
    let errors = Arc::new(Mutex::new(Vec::new()));
    let _error_listener = {
        let errors = errors.clone();
        h.session.add_error_listener(move |event| {
            errors.lock().unwrap().push(event.error.message.clone());
        })
    };

    h.bus
        .publish(
            CHANNEL,
            bytes::Bytes::from(
                serde_json::json!({
                    "type": "CONSOLE",
                    "device": {"id": "d1", "name": "iPhone", "platform": "ios"},
                    "method": "log",
                    "payload": ["hello", 1],
                })
                .to_string(),
            ),
        )
        .await
        .unwrap();
    h.bus
        .publish(
            CHANNEL,
            bytes::Bytes::from(
                serde_json::json!({
                    "type": "ERROR",
                    "error": "{\"message\":\"boom\",\"loc\":{\"line\":3,\"column\":7}}",
                })
                .to_string(),
            ),
        )
        .await
        .unwrap();

    settle().await;
    assert_eq!(*logs.lock().unwrap(), vec![("log".to_string(), 2)]);
    assert_eq!(*errors.lock().unwrap(), vec!["boom".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn send_code_reconciles_the_file_map_key_for_key() {
    let h = harness(HashMap::from([
        ("app.js".to_string(), SnackFile::code("a")),
        ("old.js".to_string(), SnackFile::code("gone soon")),
    ]));

    let next = HashMap::from([
        ("app.js".to_string(), SnackFile::code("b")),
        ("new.js".to_string(), SnackFile::code("fresh")),
    ]);
    h.session.send_code(next.clone()).await.unwrap();

    let state = h.session.get_state();
    assert_eq!(state.files, next);
}

#[tokio::test(start_paused = true)]
async fn asset_blobs_are_uploaded_during_send() {
    let h = harness(HashMap::new());
    h.session
        .send_code(HashMap::from([
            ("logo.png".to_string(), SnackFile::asset_blob("logo.png", vec![1, 2, 3])),
            ("app.js".to_string(), SnackFile::code("render()")),
        ]))
        .await
        .unwrap();

    assert_eq!(h.api.asset_uploads.load(Ordering::SeqCst), 1);
    let state = h.session.get_state();
    assert_eq!(
        state.files["logo.png"],
        SnackFile::asset_url(format!("{S3_PREFIX}/assets/logo.png"))
    );
}

#[tokio::test(start_paused = true)]
async fn is_saved_tracks_construction_and_save() {
    let h = harness(app_files("one()"));
    assert!(h.session.get_state().is_saved);

    h.session.send_code(app_files("two()")).await.unwrap();
    assert!(!h.session.get_state().is_saved);

    let response = h.session.save().await.expect("save succeeds");
    assert_eq!(response.id, "snack-id-1");
    assert!(h.session.get_state().is_saved);

    let saves = h.api.saves.lock().unwrap();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].manifest.sdk_version, "26.0.0");
    assert_eq!(saves[0].code["app.js"].contents, "two()");
}

#[tokio::test(start_paused = true)]
async fn url_switches_from_channel_to_saved_snack() {
    let h = harness(app_files("one()"));
    assert_eq!(h.session.url(), format!("exp://snack.expo.io/@snack/sdk.26.0.0-{CHANNEL}"));

    h.session.save().await.unwrap();
    assert_eq!(h.session.url(), "https://snack.expo.io/snack-id-1");

    let download = h.session.download_url().await.unwrap();
    assert_eq!(download, "https://expo.io/--/api/v2/snack/download/snack-id-1");
}

#[tokio::test(start_paused = true)]
async fn state_listeners_observe_mutations_in_order() {
    let h = harness(app_files("one()"));
    let names = Arc::new(Mutex::new(Vec::new()));
    let _listener = {
        let names = names.clone();
        h.session.add_state_listener(move |state| {
            names.lock().unwrap().push(state.name.clone());
        })
    };

    h.session.set_name("first");
    h.session.set_name("second");
    assert_eq!(
        *names.lock().unwrap(),
        vec![Some("first".to_string()), Some("second".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn legacy_sdk_publishes_single_code_payload() {
    let bus = Arc::new(LocalBus::new());
    let mut rx = bus.subscribe(CHANNEL, false);
    let mut options = SessionOptions::with_files(app_files("console.log(1)"));
    options.session_id = Some(CHANNEL.to_string());
    options.sdk_version = Some("20.0.0".to_string());
    let session = Session::with_backends(
        options,
        bus,
        Arc::new(MockApi::default()),
        Arc::new(MockBundler::default()),
    )
    .unwrap();
    session.start().await;

    session.send_code(app_files("console.log(2)")).await.unwrap();
    tokio::time::advance(Duration::from_millis(550)).await;

    let value = next_code(&mut rx).await;
    assert_eq!(value["code"], "console.log(2)");
    assert!(value.get("diff").is_none());
}

#[test]
fn short_channel_is_rejected_at_construction() {
    let mut options = SessionOptions::default();
    options.session_id = Some("abc".to_string());
    let result = Session::with_backends(
        options,
        Arc::new(LocalBus::new()),
        Arc::new(MockApi::default()),
        Arc::new(MockBundler::default()),
    );
    assert!(matches!(result, Err(SnackError::InvalidConfig(_))));
}
