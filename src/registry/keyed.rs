//! Keyed registry of independent limiters.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::sweeper;
use crate::config::{LimiterConfig, RegistryOptions};
use crate::error::{GuardError, QuotaError, Result};
use crate::ratelimit::{
    Clock, KeyedObserver, Limiter, LimiterObserver, NoopObserver, Snapshot, SystemClock,
};

/// One live key.
struct RegistryEntry {
    limiter: Limiter,
    last_accessed: Mutex<Instant>,
}

impl RegistryEntry {
    fn touch(&self, now: Instant) {
        let mut last = self.last_accessed.lock();
        if now > *last {
            *last = now;
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_accessed.lock())
    }
}

/// Forwards one limiter's notifications to a registry-wide observer.
struct KeyedAdapter {
    key: String,
    observer: Arc<dyn KeyedObserver>,
}

impl LimiterObserver for KeyedAdapter {
    fn on_admitted(&self, remaining: u64) {
        self.observer.on_admitted(&self.key, remaining);
    }

    fn on_limited(&self, retry_after: Duration) {
        self.observer.on_limited(&self.key, retry_after);
    }

    fn on_reset(&self) {
        self.observer.on_reset(&self.key);
    }
}

/// Builder for [`Registry`].
pub struct RegistryBuilder {
    template: LimiterConfig,
    options: RegistryOptions,
    clock: Arc<dyn Clock>,
    observer: Option<Arc<dyn KeyedObserver>>,
}

impl RegistryBuilder {
    /// Registry settings (idle timeout and sweep interval).
    pub fn options(mut self, options: RegistryOptions) -> Self {
        self.options = options;
        self
    }

    /// Clock used for admissions and idle tracking.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Observer notified of every key's transitions and evictions.
    pub fn observer(mut self, observer: Arc<dyn KeyedObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Validate and build the registry, starting the idle sweep if one is
    /// configured.
    ///
    /// A background sweep needs a tokio runtime; building one outside a
    /// runtime fails with a configuration error.
    pub fn build(self) -> Result<Arc<Registry>> {
        self.template.validate()?;
        self.options.validate()?;

        let handle = match self.options.sweep_interval {
            Some(_) => Some(tokio::runtime::Handle::try_current().map_err(|_| {
                QuotaError::Config(
                    "idle sweep requires a tokio runtime; disable sweep_interval to evict manually"
                        .to_string(),
                )
            })?),
            None => None,
        };

        let registry = Arc::new(Registry {
            entries: DashMap::new(),
            template: self.template,
            options: self.options,
            clock: self.clock,
            observer: self.observer,
            sweeper: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        if let (Some(handle), Some(interval)) = (handle, registry.options.sweep_interval) {
            let task = sweeper::spawn(&handle, Arc::downgrade(&registry), interval);
            *registry.sweeper.lock() = Some(task);
        }

        info!(
            algorithm = %registry.template.algorithm,
            capacity = registry.template.capacity,
            window_ms = registry.template.window.as_millis() as u64,
            idle_timeout_ms = registry.options.idle_timeout.as_millis() as u64,
            sweep_interval_ms = ?registry.options.sweep_interval.map(|d| d.as_millis() as u64),
            "Limiter registry started"
        );
        Ok(registry)
    }
}

/// Many independent limiters keyed by an opaque string.
///
/// Entries are created from a shared template the first time a key is used
/// and evicted once idle longer than the configured timeout, which gives a
/// returning key a full quota. Entry creation is single-flight: concurrent
/// first calls for one key always share one limiter.
///
/// Lock order is map shard, then an entry's access time. A limiter's own
/// lock is only taken after the shard guard has been dropped.
pub struct Registry {
    entries: DashMap<String, Arc<RegistryEntry>>,
    template: LimiterConfig,
    options: RegistryOptions,
    clock: Arc<dyn Clock>,
    observer: Option<Arc<dyn KeyedObserver>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Registry {
    /// Start building a registry whose entries use `template`.
    pub fn builder(template: LimiterConfig) -> RegistryBuilder {
        RegistryBuilder {
            template,
            options: RegistryOptions::default(),
            clock: Arc::new(SystemClock),
            observer: None,
        }
    }

    /// Build a registry on the system clock.
    pub fn new(template: LimiterConfig, options: RegistryOptions) -> Result<Arc<Self>> {
        Self::builder(template).options(options).build()
    }

    /// Run `operation` under the quota for `key`.
    pub async fn dispatch<F, Fut, T, E>(
        &self,
        key: &str,
        operation: F,
    ) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let entry = self.entry(key).ok_or(GuardError::Destroyed)?;
        let result = entry.limiter.guard(operation).await;
        entry.touch(self.clock.now());
        result
    }

    /// Synchronous variant of [`dispatch`](Self::dispatch).
    pub fn dispatch_sync<F, T, E>(
        &self,
        key: &str,
        operation: F,
    ) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> std::result::Result<T, E>,
    {
        let entry = self.entry(key).ok_or(GuardError::Destroyed)?;
        let result = entry.limiter.guard_sync(operation);
        entry.touch(self.clock.now());
        result
    }

    /// Whether a call for `key` would be admitted now. Unknown keys would
    /// start with a full quota.
    pub fn can_admit(&self, key: &str) -> bool {
        match self.lookup(key) {
            Some(entry) => entry.limiter.can_admit(),
            None => !self.is_destroyed(),
        }
    }

    /// Snapshot of one key, if it is live.
    pub fn snapshot(&self, key: &str) -> Option<Snapshot> {
        self.lookup(key).map(|entry| entry.limiter.snapshot())
    }

    /// Point-in-time snapshots of every live key.
    pub fn snapshots(&self) -> HashMap<String, Snapshot> {
        let live: Vec<(String, Arc<RegistryEntry>)> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();

        live.into_iter()
            .map(|(key, entry)| (key, entry.limiter.snapshot()))
            .collect()
    }

    /// Reset one key's limiter. Returns `false` if the key is not live.
    pub fn reset(&self, key: &str) -> bool {
        match self.lookup(key) {
            Some(entry) => {
                entry.limiter.reset();
                true
            }
            None => false,
        }
    }

    /// Evict every entry idle longer than the timeout, returning how many
    /// were removed.
    ///
    /// Entries with a call in flight are kept regardless of idle time.
    pub fn evict_now(&self) -> usize {
        let now = self.clock.now();
        let idle_timeout = self.options.idle_timeout;
        let mut evicted = Vec::new();

        self.entries.retain(|key, entry| {
            let in_flight = Arc::strong_count(entry) > 1;
            let keep = in_flight || entry.idle_for(now) <= idle_timeout;
            if !keep {
                evicted.push(key.clone());
            }
            keep
        });

        for key in &evicted {
            debug!(key = %key, "Evicted idle limiter");
            if let Some(observer) = &self.observer {
                observer.on_evicted(key);
            }
        }
        evicted.len()
    }

    /// Stop the sweep and drop every entry. Later dispatches fail with
    /// [`GuardError::Destroyed`].
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        let dropped = self.entries.len();
        self.entries.clear();
        info!(dropped = dropped, "Limiter registry destroyed");
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` currently has a limiter.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// The template new entries are built from.
    pub fn template(&self) -> &LimiterConfig {
        &self.template
    }

    fn lookup(&self, key: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Fetch or create the entry for `key` and mark it accessed.
    fn entry(&self, key: &str) -> Option<Arc<RegistryEntry>> {
        if self.is_destroyed() {
            return None;
        }
        let now = self.clock.now();

        if let Some(entry) = self.entries.get(key) {
            entry.touch(now);
            return Some(entry.value().clone());
        }

        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(key = %key, "Creating limiter for new key");
                Arc::new(RegistryEntry {
                    limiter: Limiter::from_validated(
                        self.template.clone(),
                        self.clock.clone(),
                        self.observer_for(key),
                    ),
                    last_accessed: Mutex::new(now),
                })
            })
            .value()
            .clone();
        entry.touch(now);

        // destroy() may have cleared the map between the check above and the insert.
        if self.is_destroyed() {
            self.entries
                .remove_if(key, |_, live| Arc::ptr_eq(live, &entry));
            return None;
        }
        Some(entry)
    }

    fn observer_for(&self, key: &str) -> Arc<dyn LimiterObserver> {
        match &self.observer {
            Some(observer) => Arc::new(KeyedAdapter {
                key: key.to_string(),
                observer: observer.clone(),
            }),
            None => Arc::new(NoopObserver),
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("template", &self.template)
            .field("options", &self.options)
            .field("live", &self.entries.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use tokio::sync::oneshot;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn manual_registry(
        template: LimiterConfig,
        idle_ms: u64,
    ) -> (Arc<Registry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let registry = Registry::builder(template)
            .options(RegistryOptions::manual(ms(idle_ms)))
            .clock(clock.clone())
            .build()
            .unwrap();
        (registry, clock)
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl KeyedObserver for Recorder {
        fn on_admitted(&self, key: &str, remaining: u64) {
            self.events.lock().push(format!("admitted {} {}", key, remaining));
        }

        fn on_limited(&self, key: &str, retry_after: Duration) {
            self.events
                .lock()
                .push(format!("limited {} {}", key, retry_after.as_millis()));
        }

        fn on_evicted(&self, key: &str) {
            self.events.lock().push(format!("evicted {}", key));
        }
    }

    #[test]
    fn test_registry_creation() {
        let (registry, _clock) = manual_registry(LimiterConfig::default(), 1000);
        assert!(registry.is_empty());
        assert!(!registry.is_destroyed());
        assert!(registry.can_admit("anyone"));
    }

    #[test]
    fn test_dispatch_creates_entry() {
        let (registry, _clock) = manual_registry(LimiterConfig::default(), 1000);

        let value = registry.dispatch_sync("user_a", || Ok::<_, ()>(42)).unwrap();

        assert_eq!(value, 42);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains_key("user_a"));
        assert_eq!(registry.snapshot("user_a").unwrap().remaining, 9);
    }

    #[test]
    fn test_keys_have_separate_quotas() {
        let (registry, _clock) = manual_registry(LimiterConfig::fixed_window(2, ms(1000)), 1000);

        registry.dispatch_sync("a", || Ok::<_, ()>(())).unwrap();
        registry.dispatch_sync("a", || Ok::<_, ()>(())).unwrap();
        let err = registry.dispatch_sync("a", || Ok::<_, ()>(())).unwrap_err();
        assert!(err.is_limited());

        assert!(registry.dispatch_sync("b", || Ok::<_, ()>(())).is_ok());

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots["a"].remaining, 0);
        assert!(snapshots["a"].limited);
        assert_eq!(snapshots["b"].remaining, 1);
    }

    #[test]
    fn test_idle_entry_is_evicted_and_recreated_full() {
        let (registry, clock) =
            manual_registry(LimiterConfig::sliding_window(3, ms(60_000)), 500);

        for _ in 0..3 {
            registry.dispatch_sync("idle", || Ok::<_, ()>(())).unwrap();
        }
        assert!(!registry.can_admit("idle"));

        clock.advance(ms(400));
        registry.dispatch_sync("busy", || Ok::<_, ()>(())).unwrap();

        clock.advance(ms(200));
        assert_eq!(registry.evict_now(), 1);
        assert!(!registry.snapshots().contains_key("idle"));
        assert!(registry.contains_key("busy"));

        registry.dispatch_sync("idle", || Ok::<_, ()>(())).unwrap();
        let snapshot = registry.snapshot("idle").unwrap();
        assert_eq!(snapshot.remaining, 2);
        assert_eq!(snapshot.total_admitted, 1);
    }

    #[test]
    fn test_entry_at_threshold_is_kept() {
        let (registry, clock) = manual_registry(LimiterConfig::default(), 500);
        registry.dispatch_sync("k", || Ok::<_, ()>(())).unwrap();

        clock.advance(ms(500));
        assert_eq!(registry.evict_now(), 0);
        clock.advance(ms(1));
        assert_eq!(registry.evict_now(), 1);
    }

    #[test]
    fn test_limited_calls_keep_entry_alive() {
        let (registry, clock) = manual_registry(LimiterConfig::fixed_window(1, ms(60_000)), 500);
        registry.dispatch_sync("k", || Ok::<_, ()>(())).unwrap();

        clock.advance(ms(400));
        assert!(registry.dispatch_sync("k", || Ok::<_, ()>(())).is_err());
        clock.advance(ms(400));
        assert_eq!(registry.evict_now(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_entry_is_not_evicted() {
        let (registry, clock) = manual_registry(LimiterConfig::default(), 100);
        let (tx, rx) = oneshot::channel::<u32>();

        let worker = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .dispatch("slow", || async move { rx.await.map_err(|_| "sender dropped") })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(registry.contains_key("slow"));

        clock.advance(ms(1000));
        assert_eq!(registry.evict_now(), 0);

        tx.send(5).unwrap();
        assert_eq!(worker.await.unwrap().unwrap(), 5);

        clock.advance(ms(1000));
        assert_eq!(registry.evict_now(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_evicts_idle_keys() {
        let clock = Arc::new(ManualClock::new());
        let registry = Registry::builder(LimiterConfig::default())
            .options(RegistryOptions {
                idle_timeout: ms(100),
                sweep_interval: Some(ms(50)),
            })
            .clock(clock.clone())
            .build()
            .unwrap();

        registry.dispatch("k", || async { Ok::<_, ()>(()) }).await.unwrap();
        assert_eq!(registry.len(), 1);

        clock.advance(ms(200));
        tokio::time::sleep(ms(120)).await;

        assert!(registry.is_empty());
    }

    #[test]
    fn test_background_sweep_requires_runtime() {
        let err = Registry::builder(LimiterConfig::default())
            .options(RegistryOptions {
                idle_timeout: ms(100),
                sweep_interval: Some(ms(50)),
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
    }

    #[test]
    fn test_invalid_template_rejected() {
        let result = Registry::builder(LimiterConfig::token_bucket(0, ms(1000)))
            .options(RegistryOptions::manual(ms(1000)))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_destroy_drops_entries_and_rejects_calls() {
        let registry = Registry::new(LimiterConfig::default(), RegistryOptions::default()).unwrap();
        registry.dispatch("k", || async { Ok::<_, ()>(()) }).await.unwrap();

        registry.destroy();

        assert!(registry.is_destroyed());
        assert!(registry.is_empty());
        assert!(registry.snapshots().is_empty());
        assert!(!registry.can_admit("k"));
        let err = registry
            .dispatch("k", || async { Ok::<_, ()>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Destroyed));

        // Idempotent
        registry.destroy();
    }

    /// Destroys the registry from inside the next `now()` call once armed.
    #[derive(Default)]
    struct DestroyingClock {
        registry: Mutex<Option<std::sync::Weak<Registry>>>,
        armed: AtomicBool,
    }

    impl Clock for DestroyingClock {
        fn now(&self) -> Instant {
            if self.armed.swap(false, Ordering::SeqCst) {
                let registry = self.registry.lock().as_ref().and_then(|weak| weak.upgrade());
                if let Some(registry) = registry {
                    registry.destroy();
                }
            }
            Instant::now()
        }
    }

    #[test]
    fn test_destroy_during_entry_creation_leaves_no_entry() {
        let clock = Arc::new(DestroyingClock::default());
        let registry = Registry::builder(LimiterConfig::default())
            .options(RegistryOptions::manual(ms(1000)))
            .clock(clock.clone())
            .build()
            .unwrap();
        *clock.registry.lock() = Some(Arc::downgrade(&registry));

        clock.armed.store(true, Ordering::SeqCst);
        let err = registry.dispatch_sync("late", || Ok::<_, ()>(())).unwrap_err();

        assert!(matches!(err, GuardError::Destroyed));
        assert!(registry.is_destroyed());
        assert!(registry.is_empty());
        assert!(registry.snapshots().is_empty());
    }

    #[test]
    fn test_concurrent_first_use_shares_one_limiter() {
        let (registry, _clock) =
            manual_registry(LimiterConfig::fixed_window(1000, ms(60_000)), 1000);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let registry = &registry;
                scope.spawn(move || {
                    for _ in 0..25 {
                        registry.dispatch_sync("shared", || Ok::<_, ()>(())).unwrap();
                    }
                });
            }
        });

        assert_eq!(registry.len(), 1);
        let snapshot = registry.snapshot("shared").unwrap();
        assert_eq!(snapshot.total_admitted, 200);
        assert_eq!(snapshot.remaining, 800);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_across_keys() {
        let (registry, _clock) = manual_registry(LimiterConfig::sliding_window(2, ms(1000)), 1000);

        let calls = ["a", "a", "a", "b", "b", "c"]
            .into_iter()
            .map(|key| registry.dispatch(key, move || async move { Ok::<_, ()>(key) }));
        let results = futures::future::join_all(calls).await;

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 5);
        assert_eq!(registry.len(), 3);
        assert!(registry.snapshots()["a"].limited);
    }

    #[test]
    fn test_keyed_observer_receives_key() {
        let recorder = Arc::new(Recorder::default());
        let clock = Arc::new(ManualClock::new());
        let registry = Registry::builder(LimiterConfig::fixed_window(1, ms(1000)))
            .options(RegistryOptions::manual(ms(100)))
            .clock(clock.clone())
            .observer(recorder.clone())
            .build()
            .unwrap();

        registry.dispatch_sync("x", || Ok::<_, ()>(())).unwrap();
        clock.advance(ms(50));
        let _ = registry.dispatch_sync("x", || Ok::<_, ()>(()));
        clock.advance(ms(200));
        registry.evict_now();

        assert_eq!(
            *recorder.events.lock(),
            vec![
                "admitted x 0".to_string(),
                "limited x 950".to_string(),
                "evicted x".to_string(),
            ]
        );
    }

    #[test]
    fn test_reset_single_key() {
        let (registry, _clock) = manual_registry(LimiterConfig::fixed_window(1, ms(1000)), 1000);
        registry.dispatch_sync("k", || Ok::<_, ()>(())).unwrap();
        assert!(!registry.can_admit("k"));

        assert!(registry.reset("k"));
        assert!(registry.can_admit("k"));
        assert!(!registry.reset("missing"));
    }
}
