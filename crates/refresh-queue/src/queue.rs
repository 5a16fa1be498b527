use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::QueueConfig;
use crate::error::{FetchError, FetchResult};
use crate::file_cache::FileCache;

/// Slack applied when the drain task checks the rate gate: a tick this close
/// to the gate opening counts as open.
const RATE_GATE_GRACE_MS: i64 = 100;

/// Integration point between a [`RefreshQueue`] and the upstream it fronts.
///
/// The driver owns all request shaping (URLs, headers, auth, response
/// parsing); the queue only ever sees the derived cache key and the finished
/// [`FetchResult`].
pub trait RefreshDriver: Send + Sync + 'static {
    /// The request type fetches are issued for.
    type Request: Clone + Send + Sync + 'static;
    /// The response type stored in the cache.
    ///
    /// Serde bounds exist for file persistence; `Clone` because one fetched
    /// response is handed to every coalesced caller.
    type Response: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Derives the cache key for a request.
    ///
    /// Must be deterministic: the same request always maps to the same key.
    /// This is the only identity the queue knows about.
    fn cache_key(&self, request: &Self::Request) -> String;

    /// Fetches fresh data for a request from the upstream.
    ///
    /// There is no queue-imposed deadline on this future; a driver that
    /// wants one wraps its work in [`tokio::time::timeout`] and maps the
    /// result to [`FetchError::Timeout`].
    fn fetch(&self, request: Self::Request) -> BoxFuture<'static, FetchResult<Self::Response>>;
}

/// A single cached response together with the time it was written.
///
/// Entries are replaced wholesale by a successful fetch and never partially
/// updated. The serialized layout (`data`/`updatedAt`) is also the on-disk
/// format of the file cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheItem<T> {
    /// The cached response.
    pub data: T,
    /// When the response was fetched.
    pub updated_at: DateTime<Utc>,
}

/// A point-in-time snapshot of a queue's internals.
///
/// Taking a snapshot is side-effect free; it is meant for restricted status
/// endpoints and debugging.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Number of entries in the cache map.
    pub cache_size: usize,
    /// Number of fetches currently in flight.
    pub in_flight_fetches: usize,
    /// Earliest time at which the next queued fetch may be initiated.
    pub next_queue_refresh_time: DateTime<Utc>,
    /// Whether the background drain task is currently running.
    pub refreshing: bool,
    /// Number of requests waiting in the background queue.
    pub refresh_queue_length: usize,
    /// Cache keys of the queued requests, in FIFO order.
    pub refresh_queue: Vec<String>,
}

/// An in-flight fetch, shared by every caller that joined it.
type SharedFetch<R> = Shared<BoxFuture<'static, FetchResult<R>>>;

/// All mutable state of a queue, behind one mutex.
///
/// The lock is only ever held between `.await` points, never across them.
struct QueueState<D: RefreshDriver> {
    /// The durable read path: cache key to cached response.
    cache: HashMap<String, CacheItem<D::Response>>,
    /// In-flight markers; an entry exists exactly while a fetch for that key
    /// is outstanding.
    in_flight: HashMap<String, SharedFetch<D::Response>>,
    /// Requests awaiting background refresh, FIFO with dedup-by-key
    /// admission.
    refresh_queue: VecDeque<D::Request>,
    /// Handle of the drain task; `Some` exactly while it is running.
    drain_task: Option<JoinHandle<()>>,
    /// The rate gate: no queued fetch is initiated before this time.
    next_refresh_at: DateTime<Utc>,
}

struct QueueInner<D: RefreshDriver> {
    driver: D,
    config: QueueConfig,
    refresh_duration: TimeDelta,
    refresh_interval: TimeDelta,
    refresh_max_wait: TimeDelta,
    file_cache: FileCache,
    state: Mutex<QueueState<D>>,
}

/// A generic cache-with-background-refill coordinator.
///
/// See the [crate docs](crate) for the full design. Handles are cheap to
/// clone and share one underlying queue; separately constructed queues share
/// nothing.
pub struct RefreshQueue<D: RefreshDriver> {
    inner: Arc<QueueInner<D>>,
}

impl<D: RefreshDriver> Clone for RefreshQueue<D> {
    fn clone(&self) -> Self {
        RefreshQueue {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: RefreshDriver> std::fmt::Debug for RefreshQueue<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("RefreshQueue")
            .field("tag", &self.inner.config.log_tag)
            .field("cached items", &state.cache.len())
            .field("in-flight fetches", &state.in_flight.len())
            .field("queued requests", &state.refresh_queue.len())
            .finish()
    }
}

impl<D: RefreshDriver> RefreshQueue<D> {
    /// Creates a queue, loading any previously persisted cache from the
    /// configured file path.
    ///
    /// The background drain task is not started here; it comes and goes with
    /// queue contents.
    pub fn new(driver: D, config: QueueConfig) -> Self {
        let file_cache = FileCache::new(
            config.file_cache_path.clone(),
            config.enable_big_number_parsing,
        );
        let cache: HashMap<String, CacheItem<D::Response>> =
            file_cache.load().unwrap_or_default();
        if !cache.is_empty() {
            tracing::info!(
                tag = %config.log_tag,
                entries = cache.len(),
                "loaded cache from file"
            );
        }

        let refresh_duration = to_delta(config.refresh_duration);
        let refresh_interval = to_delta(config.refresh_interval);
        let refresh_max_wait = to_delta(config.refresh_max_wait_time);

        RefreshQueue {
            inner: Arc::new(QueueInner {
                driver,
                config,
                refresh_duration,
                refresh_interval,
                refresh_max_wait,
                file_cache,
                state: Mutex::new(QueueState {
                    cache,
                    in_flight: HashMap::new(),
                    refresh_queue: VecDeque::new(),
                    drain_task: None,
                    next_refresh_at: Utc::now(),
                }),
            }),
        }
    }

    /// Returns the raw cache entry for a request, including its timestamp.
    pub fn get_raw_cache(&self, request: &D::Request) -> Option<CacheItem<D::Response>> {
        let cache_key = self.inner.driver.cache_key(request);
        let state = self.inner.state.lock().unwrap();
        state.cache.get(&cache_key).cloned()
    }

    /// Returns the cached response for a request without blocking.
    ///
    /// Stale-while-revalidate: if the entry is missing or older than
    /// `refresh_duration`, the request is additionally enqueued for
    /// background refresh. The (possibly stale) value is returned either
    /// way; only a missing entry yields `None`.
    pub fn get_cache_data(&self, request: &D::Request) -> Option<D::Response> {
        let cache_key = self.inner.driver.cache_key(request);

        let (cached, expired) = {
            let state = self.inner.state.lock().unwrap();
            let item = state.cache.get(&cache_key);
            let expired = match item {
                None => true,
                Some(item) => {
                    Utc::now().signed_duration_since(item.updated_at) > self.inner.refresh_duration
                }
            };
            (item.map(|item| item.data.clone()), expired)
        };

        if expired {
            self.enqueue_refresh(request.clone());
        }

        cached
    }

    /// Immediately issues a fetch for the request, or joins the one already
    /// in flight for its cache key.
    ///
    /// On success the cache entry is overwritten; on failure the previous
    /// entry is left untouched and the error is propagated to every joined
    /// caller. Either way the in-flight marker is removed once the fetch
    /// settles, so a later call can retry.
    ///
    /// Initiating (not joining) a fetch also pushes out the rate gate, so
    /// caller-triggered and queue-triggered fetches share the same upstream
    /// budget.
    pub async fn force_refresh_cache_data(&self, request: D::Request) -> FetchResult<D::Response> {
        let cache_key = self.inner.driver.cache_key(&request);
        self.start_fetch(cache_key, request).await
    }

    /// Returns cached data if present (stale or not), falling back to a
    /// blocking [`force_refresh_cache_data`](Self::force_refresh_cache_data).
    ///
    /// This is the primary entry point for request handlers: the caller
    /// either gets an immediate answer or awaits the live fetch, and
    /// staleness is handled by the background path.
    pub async fn get_cache_or_fetch_data(&self, request: D::Request) -> FetchResult<D::Response> {
        if let Some(data) = self.get_cache_data(&request) {
            return Ok(data);
        }

        self.force_refresh_cache_data(request).await
    }

    /// [`get_cache_data`](Self::get_cache_data) over a slice of requests.
    pub fn batch_get_cache_data(&self, requests: &[D::Request]) -> Vec<Option<D::Response>> {
        requests
            .iter()
            .map(|request| self.get_cache_data(request))
            .collect()
    }

    /// [`force_refresh_cache_data`](Self::force_refresh_cache_data) over a
    /// batch of requests, awaited concurrently.
    ///
    /// All-or-nothing: the first failure fails the whole batch. Fetches for
    /// the other requests still run to completion and populate the cache.
    pub async fn batch_force_refresh_cache_data(
        &self,
        requests: Vec<D::Request>,
    ) -> FetchResult<Vec<D::Response>> {
        future::try_join_all(
            requests
                .into_iter()
                .map(|request| self.force_refresh_cache_data(request)),
        )
        .await
    }

    /// [`get_cache_or_fetch_data`](Self::get_cache_or_fetch_data) over a
    /// batch of requests, awaited concurrently. All-or-nothing, like
    /// [`batch_force_refresh_cache_data`](Self::batch_force_refresh_cache_data).
    pub async fn batch_get_cache_or_fetch_data(
        &self,
        requests: Vec<D::Request>,
    ) -> FetchResult<Vec<D::Response>> {
        future::try_join_all(
            requests
                .into_iter()
                .map(|request| self.get_cache_or_fetch_data(request)),
        )
        .await
    }

    /// Takes a [`QueueStatus`] snapshot.
    pub fn get_queue_status(&self) -> QueueStatus {
        let state = self.inner.state.lock().unwrap();
        QueueStatus {
            cache_size: state.cache.len(),
            in_flight_fetches: state.in_flight.len(),
            next_queue_refresh_time: state.next_refresh_at,
            refreshing: state.drain_task.is_some(),
            refresh_queue_length: state.refresh_queue.len(),
            refresh_queue: state
                .refresh_queue
                .iter()
                .map(|request| self.inner.driver.cache_key(request))
                .collect(),
        }
    }

    /// Joins or initiates the fetch for `cache_key`.
    fn start_fetch(&self, cache_key: String, request: D::Request) -> SharedFetch<D::Response> {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(pending) = state.in_flight.get(&cache_key) {
            return pending.clone();
        }

        let now = Utc::now();
        let gate = state.next_refresh_at.max(now);
        let advanced = gate
            .checked_add_signed(self.inner.refresh_interval)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let limit = now
            .checked_add_signed(self.inner.refresh_max_wait)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.next_refresh_at = advanced.min(limit);

        tracing::debug!(tag = %self.inner.config.log_tag, key = %cache_key, "refresh started");

        let inner = Arc::clone(&self.inner);
        let key = cache_key.clone();
        let task = tokio::spawn(async move {
            // The marker has to go away when the fetch settles, even by
            // panic, or the key could never be fetched again.
            let _done = CallOnDrop::new({
                let inner = Arc::clone(&inner);
                let key = key.clone();
                move || {
                    inner.state.lock().unwrap().in_flight.remove(&key);
                }
            });

            let result = inner.driver.fetch(request).await;
            match &result {
                Ok(data) => {
                    tracing::debug!(tag = %inner.config.log_tag, key = %key, "refresh succeeded");
                    let item = CacheItem {
                        data: data.clone(),
                        updated_at: Utc::now(),
                    };
                    inner.state.lock().unwrap().cache.insert(key.clone(), item);
                }
                Err(error) => {
                    tracing::error!(
                        tag = %inner.config.log_tag,
                        key = %key,
                        %error,
                        "refresh failed"
                    );
                }
            }
            result
        });

        let pending: SharedFetch<D::Response> = async move {
            match task.await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Canceled),
            }
        }
        .boxed()
        .shared();

        state.in_flight.insert(cache_key, pending.clone());
        pending
    }

    /// Appends a request to the background queue unless one with the same
    /// cache key is already waiting, and makes sure the drain task runs.
    fn enqueue_refresh(&self, request: D::Request) {
        let cache_key = self.inner.driver.cache_key(&request);

        let mut state = self.inner.state.lock().unwrap();
        let already_queued = state
            .refresh_queue
            .iter()
            .any(|queued| self.inner.driver.cache_key(queued) == cache_key);
        if already_queued {
            return;
        }

        state.refresh_queue.push_back(request);
        self.ensure_drain_task(&mut state);
    }

    /// Starts the drain task if it is not running. Idempotent.
    fn ensure_drain_task(&self, state: &mut QueueState<D>) {
        if state.drain_task.is_some() {
            return;
        }

        tracing::info!(
            tag = %self.inner.config.log_tag,
            queue_length = state.refresh_queue.len(),
            "refresh queue started"
        );

        let queue = self.clone();
        state.drain_task = Some(tokio::spawn(async move { queue.drain_queue().await }));
    }

    /// The background refill loop: one dequeue per tick, gated by
    /// `next_refresh_at`; persists the cache and exits once the queue is
    /// empty.
    async fn drain_queue(self) {
        enum Tick<R, C> {
            Gated(TimeDelta),
            Fetch(R),
            Persist(C),
        }

        // tokio intervals reject a zero period
        let period = self.inner.config.refresh_interval.max(Duration::from_millis(1));
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick of a fresh interval fires immediately
        ticks.tick().await;

        loop {
            ticks.tick().await;

            let action = {
                let mut state = self.inner.state.lock().unwrap();
                let wait = state.next_refresh_at.signed_duration_since(Utc::now());
                if wait.num_milliseconds() > RATE_GATE_GRACE_MS {
                    Tick::Gated(wait)
                } else if let Some(request) = state.refresh_queue.pop_front() {
                    Tick::Fetch(request)
                } else {
                    Tick::Persist(state.cache.clone())
                }
            };

            match action {
                Tick::Gated(wait) => {
                    tracing::debug!(
                        tag = %self.inner.config.log_tag,
                        wait_ms = wait.num_milliseconds(),
                        "rate gate closed, skipping tick"
                    );
                }
                Tick::Fetch(request) => {
                    // Fire and forget: a slow or failing fetch must not stop
                    // the loop. Failures are already logged by the fetch
                    // task; the error is observed here only to consume it.
                    let queue = self.clone();
                    tokio::spawn(async move {
                        let _ = queue.force_refresh_cache_data(request).await;
                    });
                }
                Tick::Persist(snapshot) => {
                    // Persist first, stop second: a status snapshot must not
                    // report an idle queue while the cache file is still
                    // being written.
                    self.inner.file_cache.save(&snapshot);

                    let mut state = self.inner.state.lock().unwrap();
                    if state.refresh_queue.is_empty() {
                        state.drain_task = None;
                        tracing::info!(tag = %self.inner.config.log_tag, "refresh queue finished");
                        break;
                    }
                    // new work arrived while the file was being written;
                    // keep draining
                }
            }
        }
    }
}

/// Clamps a config duration into chrono's range.
fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called
/// while dropping an item, this might result in aborting program execution.
struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}
