//! Health-check scheduler for quarantined routes
//!
//! When a dial fails, the forwarder hands the route to this scheduler. The
//! route's `healthy` flag is cleared, a TCP-connect probe is queued at
//! `now + interval`, and one worker task is spawned for the rehabilitation.
//! Workers are not pooled: one exists per unhealthy event and terminates
//! once its probe target is reinstated or goes inactive, so the worker
//! population is bounded by the number of currently-unhealthy routes.
//!
//! For a single route successive probes never interleave, because a worker
//! only re-enqueues an item after executing it. No ordering is promised
//! across routes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::queue::TaskQueue;
use crate::forward::Route;

/// Default initial queue capacity
const DEFAULT_MAX_ITEMS: usize = 16;

/// Default consecutive successes before a route is reinstated
const DEFAULT_RELEASE_CHECKS: u32 = 1;

/// Default probe interval in milliseconds
const DEFAULT_CHECK_INTERVAL_MS: u64 = 5000;

/// Scheduler tuning knobs
#[derive(Debug, Clone, Copy)]
pub struct HealthSchedulerOptions {
    /// Initial capacity of the probe queue
    pub max_items: usize,
    /// Consecutive successful probes required to reinstate a route
    pub release_checks: u32,
    /// Interval between probes for one route, in milliseconds
    pub check_interval_ms: u64,
}

impl Default for HealthSchedulerOptions {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            release_checks: DEFAULT_RELEASE_CHECKS,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
        }
    }
}

impl HealthSchedulerOptions {
    /// Normalize zero fields to their defaults
    #[must_use]
    fn normalized(self) -> Self {
        Self {
            max_items: if self.max_items == 0 {
                DEFAULT_MAX_ITEMS
            } else {
                self.max_items
            },
            release_checks: if self.release_checks == 0 {
                DEFAULT_RELEASE_CHECKS
            } else {
                self.release_checks
            },
            check_interval_ms: if self.check_interval_ms == 0 {
                DEFAULT_CHECK_INTERVAL_MS
            } else {
                self.check_interval_ms
            },
        }
    }
}

/// One queued rehabilitation probe
#[derive(Debug)]
struct HealthCheckItem {
    /// Route under rehabilitation
    route: Arc<Route>,
    /// Timeout for each connect probe
    probe_timeout: Duration,
    /// Consecutive successes; reset by any failure
    successes: u32,
    /// Consecutive failures; reset by any success
    failures: u32,
}

/// Scheduler running recovery probes for quarantined routes
#[derive(Debug)]
pub struct HealthCheckScheduler {
    queue: Mutex<TaskQueue<HealthCheckItem>>,
    next_id: AtomicU64,
    /// Set by pollers with nothing eligible; cleared by the waking push
    sleeping: AtomicBool,
    task_added: Notify,
    release_checks: u32,
    check_interval_ms: u64,
}

impl HealthCheckScheduler {
    /// Create a scheduler with the given options
    #[must_use]
    pub fn new(options: HealthSchedulerOptions) -> Arc<Self> {
        let options = options.normalized();
        Arc::new(Self {
            queue: Mutex::new(TaskQueue::with_capacity(options.max_items)),
            next_id: AtomicU64::new(0),
            sleeping: AtomicBool::new(false),
            task_added: Notify::new(),
            release_checks: options.release_checks,
            check_interval_ms: options.check_interval_ms,
        })
    }

    /// Quarantine a route and start probing it
    ///
    /// Clears the route's health flag, queues the first probe for
    /// `now + check_interval` and spawns a worker dedicated to this
    /// rehabilitation. The worker exits when the route is reinstated, goes
    /// inactive, or `cancel` fires.
    pub fn add_unhealthy(
        self: &Arc<Self>,
        route: Arc<Route>,
        probe_timeout: Duration,
        cancel: CancellationToken,
    ) {
        route.set_healthy(false);
        debug!(address = route.address(), "route quarantined");

        self.enqueue(HealthCheckItem {
            route,
            probe_timeout,
            successes: 0,
            failures: 0,
        });

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.watch(cancel).await;
        });
    }

    /// Number of probes currently queued
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Queue an item at `now + check_interval`, waking one sleeper when it
    /// lands at the head
    fn enqueue(&self, item: HealthCheckItem) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let priority = unix_now() + self.check_interval_ms / 1000;
        trace!(
            id,
            priority,
            address = item.route.address(),
            "probe scheduled"
        );

        let became_head = self.queue.lock().push(id, priority, item);
        if became_head
            && self
                .sleeping
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.task_added.notify_one();
        }
    }

    /// One worker loop: poll, probe, account, reinstate or re-enqueue
    async fn watch(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let Some(mut item) = self.poll(&cancel).await else {
                return;
            };

            match probe(item.route.address(), item.probe_timeout).await {
                Ok(()) => {
                    item.successes += 1;
                    item.failures = 0;
                }
                Err(reason) => {
                    error!(address = item.route.address(), %reason, "route unreachable");
                    item.failures += 1;
                    item.successes = 0;
                }
            }

            // A deactivated route is not worth rehabilitating
            if !item.route.is_active() {
                return;
            }

            if item.successes >= self.release_checks {
                item.route.set_healthy(true);
                debug!(address = item.route.address(), "route reinstated");
                return;
            }

            self.enqueue(item);
        }
    }

    /// Wait for the earliest eligible item
    ///
    /// Returns `None` when `cancel` fires. When the queue is empty or the
    /// head is still in the future, the poller marks itself sleeping and
    /// waits for the wake signal or the head's deadline, then re-peeks.
    async fn poll(&self, cancel: &CancellationToken) -> Option<HealthCheckItem> {
        loop {
            let now = unix_now();
            let wait_secs = {
                let mut queue = self.queue.lock();
                match queue.peek() {
                    None => {
                        self.sleeping.store(true, Ordering::SeqCst);
                        None
                    }
                    Some(head) if head.priority <= now => {
                        let item = queue.pop().expect("peeked head exists");
                        return Some(item.value);
                    }
                    Some(head) => {
                        self.sleeping.store(true, Ordering::SeqCst);
                        Some(head.priority - now)
                    }
                }
            };

            match wait_secs {
                None => {
                    tokio::select! {
                        () = self.task_added.notified() => {}
                        () = cancel.cancelled() => return None,
                    }
                }
                Some(secs) => {
                    tokio::select! {
                        () = self.task_added.notified() => {}
                        () = tokio::time::sleep(Duration::from_secs(secs)) => {}
                        () = cancel.cancelled() => return None,
                    }
                }
            }
        }
    }
}

/// Attempt a TCP connect within `probe_timeout`; closing counts as success
async fn probe(address: &str, probe_timeout: Duration) -> Result<(), String> {
    match timeout(probe_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(())
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!(
            "connect timed out after {}ms",
            probe_timeout.as_millis()
        )),
    }
}

/// Current unix time in whole seconds
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
