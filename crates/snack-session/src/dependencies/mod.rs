//! Dependency resolution: static import discovery, bundler reconciliation,
//! version pinning, and peer-dependency injection.

pub mod bundler;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::error::SnackError;
use crate::imports::{scanner, writer};
use crate::model::SnackFile;
use self::bundler::{poll_bundle, BundlerClient, PLATFORMS};

/// Module names that are provided by the runtime and must never be
/// treated as third-party dependencies.
pub const RESERVED_MODULES: &[&str] = &["react", "react-native", "expo"];

/// Pin used when no version was requested and the bundler could not
/// report one.
pub const DEFAULT_PIN: &str = "latest";

/// Sentinel pin for dependencies that could not be resolved at all.
pub const ERROR_PIN: &str = "error";

pub fn is_reserved(name: &str) -> bool {
    RESERVED_MODULES.contains(&name)
}

/// Terminal result of resolving one `(name, version)` pair. Failures are
/// folded into the value: a soft failure keeps a usable version with an
/// error note, a hard failure pins [`ERROR_PIN`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDependency {
    pub name: String,
    pub version: String,
    pub dependencies: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl ResolvedDependency {
    pub fn is_unavailable(&self) -> bool {
        self.version == ERROR_PIN
    }
}

/// One source file that needs resolution: its contents at scan time (the
/// race-guard anchor) and the imports whose pins diverge from session
/// state.
#[derive(Debug, Clone)]
pub struct FilePlan {
    pub key: String,
    pub anchor: String,
    pub changed: Vec<(String, Option<String>)>,
}

/// Result of executing a set of [`FilePlan`]s.
#[derive(Debug, Clone, Default)]
pub struct ResolutionOutcome {
    pub updates: Vec<FileUpdate>,
    /// Pin set to merge into the session dependency map.
    pub pins: BTreeMap<String, String>,
    /// Names that ended up pinned to the error sentinel.
    pub unavailable: Vec<ResolvedDependency>,
}

#[derive(Debug, Clone)]
pub struct FileUpdate {
    pub key: String,
    /// Contents captured at scan time; the rewrite is discarded when the
    /// live file no longer matches.
    pub anchor: String,
    pub code: String,
}

type SharedFetch = Shared<BoxFuture<'static, ResolvedDependency>>;

/// The promise cache holds either the in-flight fetch or its settled
/// value; the value replaces the future in the same slot once known.
enum CacheSlot {
    Pending(SharedFetch),
    Ready(ResolvedDependency),
}

pub struct Resolver {
    bundler: Arc<dyn BundlerClient>,
    cache: parking_lot::Mutex<HashMap<String, CacheSlot>>,
    resolving: AtomicBool,
}

/// Holds the single resolution slot; dropping it releases the slot on
/// every exit path, panics included.
pub struct ResolutionGuard<'a> {
    resolver: &'a Resolver,
}

impl Drop for ResolutionGuard<'_> {
    fn drop(&mut self) {
        self.resolver.resolving.store(false, Ordering::SeqCst);
    }
}

impl Resolver {
    pub fn new(bundler: Arc<dyn BundlerClient>) -> Self {
        Self {
            bundler,
            cache: parking_lot::Mutex::new(HashMap::new()),
            resolving: AtomicBool::new(false),
        }
    }

    pub fn is_resolving(&self) -> bool {
        self.resolving.load(Ordering::SeqCst)
    }

    /// Claim the single resolution slot; `None` means a resolution is
    /// already running and the caller must back off. The slot is held by
    /// the returned guard and released on drop, so a panicking or
    /// early-returning resolution can never wedge the engine.
    pub fn try_begin(&self) -> Option<ResolutionGuard<'_>> {
        if self.resolving.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(ResolutionGuard { resolver: self })
    }

    /// Scan every `.js` file and report the ones whose imports diverge
    /// from the session dependency map. Files that fail to parse are
    /// skipped.
    pub fn plan(
        files: &HashMap<String, SnackFile>,
        dependencies: &BTreeMap<String, String>,
    ) -> Vec<FilePlan> {
        let mut keys: Vec<&String> = files
            .keys()
            .filter(|key| key.ends_with(".js"))
            .collect();
        keys.sort();

        let mut plans = Vec::new();
        for key in keys {
            let Some(contents) = files[key].as_code() else {
                continue;
            };
            let modules = match scanner::scan(contents) {
                Ok(modules) => modules,
                Err(err) => {
                    debug!(key = %key, error = %err, "skipping unparseable file");
                    continue;
                }
            };
            let changed: Vec<(String, Option<String>)> = modules
                .into_iter()
                .filter(|(name, _)| !is_reserved(name))
                .filter(|(name, pin)| match dependencies.get(name) {
                    None => true,
                    Some(current) => matches!(pin, Some(requested) if requested != current),
                })
                .collect();
            if changed.is_empty() {
                continue;
            }
            plans.push(FilePlan {
                key: key.clone(),
                anchor: contents.to_string(),
                changed,
            });
        }
        plans
    }

    /// Fetch every changed module, expand peers one level, and produce
    /// the rewritten sources and the pin set to commit.
    pub async fn execute(&self, plans: Vec<FilePlan>) -> ResolutionOutcome {
        let mut outcome = ResolutionOutcome::default();

        for plan in plans {
            let mut direct = Vec::new();
            for (name, version) in &plan.changed {
                direct.push(self.fetch(name, version.as_deref()).await);
            }

            // One level only: peers of peers are not expanded.
            let peer_specs: BTreeMap<String, String> = direct
                .iter()
                .flat_map(|resolved| resolved.dependencies.iter())
                .filter(|(name, _)| !is_reserved(name))
                .map(|(name, spec)| (name.clone(), spec.clone()))
                .collect();
            let mut peers = Vec::new();
            for (name, spec) in &peer_specs {
                let version = Some(spec.as_str()).filter(|spec| !spec.is_empty());
                peers.push(self.fetch(name, version).await);
            }

            // Direct results win over peers on collision.
            let mut pins = BTreeMap::new();
            for resolved in peers.iter().chain(direct.iter()) {
                pins.insert(resolved.name.clone(), resolved.version.clone());
            }

            let mut code = plan.anchor.clone();
            for peer in &peers {
                code = writer::insert(&code, &peer.name);
            }
            code = writer::write(&code, &pins);

            let mut seen = BTreeSet::new();
            for resolved in direct.into_iter().chain(peers.into_iter()) {
                if !seen.insert(resolved.name.clone()) {
                    continue;
                }
                if resolved.is_unavailable() {
                    outcome.unavailable.push(resolved);
                }
            }

            outcome.pins.extend(pins);
            outcome.updates.push(FileUpdate {
                key: plan.key,
                anchor: plan.anchor,
                code,
            });
        }

        outcome
    }

    /// Memoized fetch keyed by `"<name>-<version|latest>"`. Concurrent
    /// requesters for the same key share one in-flight operation.
    pub async fn fetch(&self, name: &str, version: Option<&str>) -> ResolvedDependency {
        let key = format!("{}-{}", name, version.unwrap_or("latest"));
        let shared = {
            let mut cache = self.cache.lock();
            match cache.get(&key) {
                Some(CacheSlot::Ready(value)) => return value.clone(),
                Some(CacheSlot::Pending(fetch)) => fetch.clone(),
                None => {
                    let fetch = fetch_with_fallback(
                        self.bundler.clone(),
                        name.to_string(),
                        version.map(str::to_string),
                    )
                    .boxed()
                    .shared();
                    cache.insert(key.clone(), CacheSlot::Pending(fetch.clone()));
                    fetch
                }
            }
        };

        let value = shared.await;
        self.cache.lock().insert(key, CacheSlot::Ready(value.clone()));
        value
    }
}

async fn fetch_with_fallback(
    bundler: Arc<dyn BundlerClient>,
    name: String,
    version: Option<String>,
) -> ResolvedDependency {
    match poll_bundle(bundler.as_ref(), &name, version.as_deref()).await {
        Ok(manifest) => ResolvedDependency {
            name,
            version: manifest.version,
            dependencies: manifest.dependencies,
            error: None,
        },
        Err(err) => cdn_fallback(bundler, name, version, err).await,
    }
}

/// Probe the CDN mirror for every platform. When all platforms report a
/// finished bundle the dependency is usable despite the fetch failure;
/// otherwise it is pinned to the error sentinel.
async fn cdn_fallback(
    bundler: Arc<dyn BundlerClient>,
    name: String,
    version: Option<String>,
    err: SnackError,
) -> ResolvedDependency {
    let pinned = version.unwrap_or_else(|| DEFAULT_PIN.to_string());
    let message = err.to_string();

    let mut all_platforms_available = true;
    for platform in PLATFORMS {
        match bundler.cdn_has_bundle(&name, &pinned, platform).await {
            Ok(true) => {}
            _ => {
                all_platforms_available = false;
                break;
            }
        }
    }

    if all_platforms_available {
        debug!(name = %name, version = %pinned, "bundler failed but CDN has the bundle");
        ResolvedDependency {
            name,
            version: pinned,
            dependencies: BTreeMap::new(),
            error: Some(message),
        }
    } else {
        ResolvedDependency {
            name,
            version: ERROR_PIN.to_string(),
            dependencies: BTreeMap::new(),
            error: Some(message),
        }
    }
}
