//! Single-flight, time-boxed cache for an expensive asynchronous resolution.
//!
//! A [`Cacheable`] wraps a resolver returning `(success, value)`. Callers get
//! the cached value while it is recent; otherwise exactly one caller runs the
//! resolver while the others wait on the same gate and re-check afterwards.
//! Bounded caches arm a purge task that drops a stale value once it has gone
//! unused for a grace period past its lifetime.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::trace;

/// Extra time a stale value is kept past its lifetime before being purged.
pub const PURGE_GRACE: Duration = Duration::from_secs(5 * 60);

type Resolver<T> = Box<dyn Fn() -> BoxFuture<'static, (bool, T)> + Send + Sync>;

/// What [`Cacheable::get_value`] returns when the resolver fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fallback {
    /// `T::default()`.
    #[default]
    DefaultValue,
    /// Whatever the failed resolver returned.
    FailedNow,
    /// The last successfully resolved value, if it has not been purged.
    SuccessPreviously,
}

struct Slot<T> {
    value: Option<T>,
    resolved_at: Option<Instant>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    gate: tokio::sync::Mutex<()>,
    lifetime: Option<Duration>,
}

impl<T: Clone> Shared<T> {
    fn recent_value(&self) -> Option<T> {
        let slot = self.slot.lock();
        let resolved_at = slot.resolved_at?;
        match self.lifetime {
            Some(lifetime) if resolved_at.elapsed() >= lifetime => None,
            _ => slot.value.clone(),
        }
    }

    fn is_initialized(&self) -> bool {
        self.slot.lock().resolved_at.is_some()
    }

    fn is_stale(&self) -> bool {
        match (self.slot.lock().resolved_at, self.lifetime) {
            (Some(resolved_at), Some(lifetime)) => resolved_at.elapsed() >= lifetime,
            _ => false,
        }
    }

    fn clear(&self) {
        let mut slot = self.slot.lock();
        slot.value = None;
        slot.resolved_at = None;
    }
}

/// A lazily resolved, optionally expiring value.
pub struct Cacheable<T> {
    resolver: Resolver<T>,
    shared: Arc<Shared<T>>,
    purge_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Cacheable<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    /// Creates a cache. `lifetime = None` keeps a resolved value forever.
    pub fn new<F, Fut>(resolver: F, lifetime: Option<Duration>) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (bool, T)> + Send + 'static,
    {
        Self {
            resolver: Box::new(move || resolver().boxed()),
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    value: None,
                    resolved_at: None,
                }),
                gate: tokio::sync::Mutex::new(()),
                lifetime,
            }),
            purge_task: Mutex::new(None),
        }
    }

    /// Creates a cache whose value never expires.
    pub fn permanent<F, Fut>(resolver: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (bool, T)> + Send + 'static,
    {
        Self::new(resolver, None)
    }

    /// Returns the cached value, resolving it first if needed.
    pub async fn get_value(&self, fallback: Fallback) -> (bool, T) {
        if let Some(value) = self.shared.recent_value() {
            return (true, value);
        }

        let _gate = self.shared.gate.lock().await;

        if let Some(value) = self.shared.recent_value() {
            return (true, value);
        }

        let (success, result) = (self.resolver)().await;

        if !success {
            let value = match fallback {
                Fallback::DefaultValue => T::default(),
                Fallback::FailedNow => result,
                Fallback::SuccessPreviously => {
                    self.shared.slot.lock().value.clone().unwrap_or_default()
                }
            };
            return (false, value);
        }

        {
            let mut slot = self.shared.slot.lock();
            slot.value = Some(result.clone());
            slot.resolved_at = Some(Instant::now());
        }

        if let Some(lifetime) = self.shared.lifetime {
            self.arm_purge(lifetime);
        }

        (true, result)
    }

    /// Drops the cached value and cancels any pending purge.
    pub async fn reset(&self) {
        if !self.shared.is_initialized() {
            return;
        }

        let _gate = self.shared.gate.lock().await;
        self.shared.clear();
        if let Some(task) = self.purge_task.lock().take() {
            task.abort();
        }
    }

    fn arm_purge(&self, lifetime: Duration) {
        let shared: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            sleep(lifetime + PURGE_GRACE).await;

            let Some(shared) = shared.upgrade() else {
                return;
            };
            if !shared.is_stale() {
                return;
            }

            let _gate = shared.gate.lock().await;
            if shared.is_stale() {
                shared.clear();
                trace!("Purged stale cached value");
            }
        });

        if let Some(previous) = self.purge_task.lock().replace(task) {
            previous.abort();
        }
    }
}

impl<T> Drop for Cacheable<T> {
    fn drop(&mut self) {
        if let Some(task) = self.purge_task.get_mut().take() {
            task.abort();
        }
    }
}

impl<T> std::fmt::Debug for Cacheable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cacheable")
            .field("lifetime", &self.shared.lifetime)
            .field("resolved_at", &self.shared.slot.lock().resolved_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    fn counting(calls: Arc<AtomicUsize>, lifetime: Option<Duration>) -> Cacheable<u32> {
        Cacheable::new(
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_secs(1)).await;
                    (true, 42)
                }
            },
            lifetime,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_resolution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(counting(calls.clone(), Some(Duration::from_secs(60))));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_value(Fallback::DefaultValue).await })
            })
            .collect();

        for caller in callers {
            assert_eq!(caller.await.unwrap(), (true, 42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_value_is_resolved_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting(calls.clone(), Some(Duration::from_secs(10)));

        cache.get_value(Fallback::DefaultValue).await;
        cache.get_value(Fallback::DefaultValue).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(11)).await;
        cache.get_value(Fallback::DefaultValue).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_value_is_purged_after_grace() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting(calls, Some(Duration::from_secs(60)));

        cache.get_value(Fallback::DefaultValue).await;
        assert!(cache.shared.is_initialized());

        sleep(Duration::from_secs(60) + PURGE_GRACE + Duration::from_secs(1)).await;

        assert!(!cache.shared.is_initialized());
        assert!(cache.shared.slot.lock().value.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_policies() {
        let succeed = Arc::new(AtomicBool::new(true));
        let flag = succeed.clone();
        let cache = Cacheable::new(
            move || {
                let ok = flag.load(Ordering::SeqCst);
                async move { if ok { (true, 5u32) } else { (false, 7u32) } }
            },
            Some(Duration::from_secs(1)),
        );

        assert_eq!(cache.get_value(Fallback::DefaultValue).await, (true, 5));

        succeed.store(false, Ordering::SeqCst);
        sleep(Duration::from_secs(2)).await;

        assert_eq!(cache.get_value(Fallback::DefaultValue).await, (false, 0));
        assert_eq!(cache.get_value(Fallback::FailedNow).await, (false, 7));
        assert_eq!(cache.get_value(Fallback::SuccessPreviously).await, (false, 5));
    }

    #[tokio::test]
    async fn test_reset_forces_resolution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Cacheable::permanent({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { (true, String::from("value")) }
            }
        });

        cache.get_value(Fallback::DefaultValue).await;
        cache.reset().await;
        let (success, value) = cache.get_value(Fallback::DefaultValue).await;

        assert!(success);
        assert_eq!(value, "value");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
