//! Per-host request limiting.
//!
//! Every logical web host owns a [`RateGate`]: a concurrency cap on in-flight
//! requests and a start-rate gate that admits one request per configured
//! delay. The rate slot is released by a background task once the delay has
//! passed, whether or not the request itself has finished.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{trace, warn};

use tether_core::MAX_CONNECTIONS;

/// Concurrency and start-rate counters for one host.
#[derive(Debug, Clone)]
pub struct RateGate {
    connections: Arc<Semaphore>,
    rate: Arc<Semaphore>,
}

impl RateGate {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Arc::new(Semaphore::new(max_connections.max(1))),
            rate: Arc::new(Semaphore::new(1)),
        }
    }

    /// Requests currently allowed to start without waiting.
    pub fn available_connections(&self) -> usize {
        self.connections.available_permits()
    }
}

/// Process-wide registry of [`RateGate`]s keyed by host.
#[derive(Debug)]
pub struct WebLimiter {
    delay: Duration,
    max_connections: usize,
    gates: HashMap<String, RateGate>,
    fallback: RateGate,
}

impl WebLimiter {
    /// Creates a limiter with one gate per host in `hosts`.
    ///
    /// A zero `delay` turns every gate into a pass-through.
    pub fn new<I, S>(delay: Duration, max_connections: usize, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let gates = hosts
            .into_iter()
            .map(|host| (host.into(), RateGate::new(max_connections)))
            .collect();

        Self {
            delay,
            max_connections,
            gates,
            fallback: RateGate::new(max_connections),
        }
    }

    /// Creates a limiter with the default concurrency cap.
    pub fn with_delay<I, S>(delay: Duration, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(delay, MAX_CONNECTIONS, hosts)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Gate for `host`. Unknown hosts share a fallback gate.
    pub fn gate(&self, host: &str) -> &RateGate {
        self.gates.get(host).unwrap_or_else(|| {
            warn!(host = %host, "No rate gate registered for host, using the shared one");
            &self.fallback
        })
    }

    /// Runs `request` once both of `host`'s gates admit it.
    pub async fn limit<Fut>(&self, host: &str, request: Fut) -> Fut::Output
    where
        Fut: Future,
    {
        if self.delay.is_zero() {
            return request.await;
        }

        let gate = self.gate(host);

        // Gate semaphores are never closed.
        let _connection = gate.connections.acquire().await;

        if let Ok(rate_slot) = gate.rate.clone().acquire_owned().await {
            let delay = self.delay;
            tokio::spawn(async move {
                sleep(delay).await;
                drop(rate_slot);
            });
        }

        trace!(host = %host, "Request admitted");
        request.await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_and_fifo_admission() {
        let limiter = Arc::new(WebLimiter::new(
            Duration::from_millis(10),
            2,
            ["community.example"],
        ));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..5)
            .map(|i| {
                let limiter = limiter.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                let started = started.clone();
                tokio::spawn(async move {
                    limiter
                        .limit("community.example", async {
                            started.lock().push(i);
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            sleep(Duration::from_millis(100)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await;
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(*started.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_starts_are_spaced_by_delay() {
        let limiter = Arc::new(WebLimiter::with_delay(
            Duration::from_millis(300),
            ["store.example"],
        ));
        let origin = Instant::now();
        let starts = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let limiter = limiter.clone();
                let starts = starts.clone();
                tokio::spawn(async move {
                    limiter
                        .limit("store.example", async {
                            starts.lock().push(origin.elapsed());
                        })
                        .await;
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        let starts = starts.lock();
        assert_eq!(starts.len(), 3);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(300));
        }
    }

    #[tokio::test]
    async fn test_zero_delay_passes_through() {
        let limiter = WebLimiter::new(Duration::ZERO, 1, ["api.example"]);
        let value = limiter.limit("unknown.example", async { 7 }).await;
        assert_eq!(value, 7);
        assert_eq!(limiter.gate("api.example").available_connections(), 1);
    }
}
