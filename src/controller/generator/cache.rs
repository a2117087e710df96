//! # Generator Cache
//!
//! Process-wide cache of constructed manifest generators, keyed by a
//! fingerprint over content-identifying fields only. At most one build runs
//! per fingerprint: concurrent callers for the same fingerprint wait on a
//! per-fingerprint build lock rather than on the whole cache, so unrelated
//! builds proceed in parallel. Entries expire after a sliding validity
//! window; an owned sweep task removes expired entries and is aborted when
//! the cache shuts down.

use super::Generator;
use crate::controller::digest::calculate_digest;
use crate::controller::error::ReconcileError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default sliding validity window for cached generators.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(60 * 60);
/// Default interval of the eviction sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Cache key derived from content-identifying fields: artifact digest,
/// sub-path, decryption provider and key-bundle digest. The transport URL
/// is deliberately not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(
        artifact_digest: &str,
        path: Option<&str>,
        decryption_provider: Option<&str>,
        key_bundle_digest: &str,
    ) -> Self {
        Fingerprint(calculate_digest(&(
            artifact_digest,
            path.unwrap_or(""),
            decryption_provider.unwrap_or(""),
            key_bundle_digest,
        )))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct CacheEntry {
    generator: Arc<dyn Generator>,
    valid_until: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
    build_locks: Mutex<HashMap<Fingerprint, Arc<AsyncMutex<()>>>>,
}

impl CacheState {
    fn lookup(&self, fingerprint: &Fingerprint, validity: Duration) -> Option<Arc<dyn Generator>> {
        let mut entries = self.entries.lock().expect("generator cache poisoned");
        let now = Instant::now();
        match entries.get_mut(fingerprint) {
            Some(entry) if entry.valid_until > now => {
                // every hit slides the validity window forward
                entry.valid_until = now + validity;
                Some(Arc::clone(&entry.generator))
            }
            Some(_) => {
                entries.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    fn insert(&self, fingerprint: Fingerprint, generator: Arc<dyn Generator>, validity: Duration) {
        let mut entries = self.entries.lock().expect("generator cache poisoned");
        entries.insert(
            fingerprint,
            CacheEntry {
                generator,
                valid_until: Instant::now() + validity,
            },
        );
    }

    fn build_lock(&self, fingerprint: &Fingerprint) -> Arc<AsyncMutex<()>> {
        let mut locks = self.build_locks.lock().expect("generator cache poisoned");
        Arc::clone(
            locks
                .entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("generator cache poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.valid_until > now);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("evicted {} expired generator(s)", evicted);
        }
        // drop build locks nobody holds for fingerprints no longer cached
        let mut locks = self.build_locks.lock().expect("generator cache poisoned");
        locks.retain(|fingerprint, lock| {
            entries.contains_key(fingerprint) || Arc::strong_count(lock) > 1
        });
    }
}

/// Fingerprint-keyed generator cache with sliding TTL eviction.
///
/// Must be constructed within a tokio runtime; construction spawns the
/// eviction sweep task, which is aborted on [`GeneratorCache::shutdown`] or
/// drop.
pub struct GeneratorCache {
    state: Arc<CacheState>,
    validity: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl GeneratorCache {
    pub fn new(validity: Duration, sweep_interval: Duration) -> Self {
        let state = Arc::new(CacheState::default());
        let sweep_state = Arc::clone(&state);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sweep_state.sweep();
            }
        });
        GeneratorCache {
            state,
            validity,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Return the cached generator for `fingerprint`, or run `build` to
    /// construct it. At most one build executes per fingerprint; all
    /// concurrent callers for the same fingerprint receive the generator
    /// produced by the single build.
    pub async fn get_or_build<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        build: F,
    ) -> Result<Arc<dyn Generator>, ReconcileError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Generator>, ReconcileError>>,
    {
        if let Some(generator) = self.state.lookup(fingerprint, self.validity) {
            return Ok(generator);
        }

        // serialize builders of this fingerprint only; the cache lock is
        // never held across the build
        let build_lock = self.state.build_lock(fingerprint);
        let _guard = build_lock.lock().await;

        if let Some(generator) = self.state.lookup(fingerprint, self.validity) {
            return Ok(generator);
        }

        debug!("generator cache miss for {}", fingerprint);
        let generator = build().await?;
        self.state
            .insert(fingerprint.clone(), Arc::clone(&generator), self.validity);
        Ok(generator)
    }

    /// Stop the eviction sweep. Idempotent; also performed on drop.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().expect("generator cache poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for GeneratorCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::generator::ValueMap;
    use async_trait::async_trait;
    use kube::core::DynamicObject;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeGenerator;

    #[async_trait]
    impl Generator for FakeGenerator {
        async fn generate(
            &self,
            _namespace: &str,
            _name: &str,
            _values: &ValueMap,
        ) -> Result<Vec<DynamicObject>, ReconcileError> {
            Ok(vec![])
        }
    }

    fn fingerprint(digest: &str) -> Fingerprint {
        Fingerprint::new(digest, Some("charts/demo"), Some("sops"), "keydigest")
    }

    #[test]
    fn test_fingerprint_excludes_url_like_inputs() {
        // identical content identity yields identical fingerprint
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        // any discriminating field changes it
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_ne!(
            Fingerprint::new("abc", Some("a"), None, "k"),
            Fingerprint::new("abc", Some("b"), None, "k")
        );
        assert_ne!(
            Fingerprint::new("abc", Some("a"), None, "k1"),
            Fingerprint::new("abc", Some("a"), None, "k2")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_single_build() {
        let cache = Arc::new(GeneratorCache::new(DEFAULT_VALIDITY, DEFAULT_SWEEP_INTERVAL));
        let builds = Arc::new(AtomicUsize::new(0));
        let fp = fingerprint("abc");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            let fp = fp.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_build(&fp, || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Arc::new(FakeGenerator) as Arc<dyn Generator>)
                    })
                    .await
                    .unwrap()
            }));
        }

        let generators: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        for generator in &generators[1..] {
            assert!(Arc::ptr_eq(&generators[0], generator));
        }
    }

    #[tokio::test]
    async fn test_expired_entry_triggers_rebuild() {
        let cache = GeneratorCache::new(Duration::from_millis(50), Duration::from_millis(10));
        let builds = AtomicUsize::new(0);
        let fp = fingerprint("abc");

        for _ in 0..2 {
            cache
                .get_or_build(&fp, || async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(FakeGenerator) as Arc<dyn Generator>)
                })
                .await
                .unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        cache
            .get_or_build(&fp, || async {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(FakeGenerator) as Arc<dyn Generator>)
            })
            .await
            .unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hits_slide_the_validity_window() {
        let cache = GeneratorCache::new(Duration::from_millis(150), Duration::from_secs(3600));
        let builds = AtomicUsize::new(0);
        let fp = fingerprint("abc");

        for _ in 0..4 {
            cache
                .get_or_build(&fp, || async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(FakeGenerator) as Arc<dyn Generator>)
                })
                .await
                .unwrap();
            // each access lands well within the window and extends it
            tokio::time::sleep(Duration::from_millis(80)).await;
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_build_is_not_cached() {
        let cache = GeneratorCache::new(DEFAULT_VALIDITY, DEFAULT_SWEEP_INTERVAL);
        let fp = fingerprint("abc");

        let Err(err) = cache
            .get_or_build(&fp, || async {
                Err::<Arc<dyn Generator>, _>(ReconcileError::fatal("boom"))
            })
            .await
        else {
            panic!("build failure must propagate");
        };
        assert!(!err.is_retriable());

        let builds = AtomicUsize::new(0);
        cache
            .get_or_build(&fp, || async {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(FakeGenerator) as Arc<dyn Generator>)
            })
            .await
            .unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_have_distinct_entries() {
        let cache = GeneratorCache::new(DEFAULT_VALIDITY, DEFAULT_SWEEP_INTERVAL);
        let builds = AtomicUsize::new(0);

        for digest in ["a", "b"] {
            cache
                .get_or_build(&fingerprint(digest), || async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(FakeGenerator) as Arc<dyn Generator>)
                })
                .await
                .unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }
}
