//! A cache-with-background-refill coordinator for rate-limited upstream APIs.
//!
//! The [`RefreshQueue`] sits in front of a slow or rate-limited upstream (a
//! spreadsheet API, a third-party JSON endpoint) and gives callers an
//! immediate answer from an in-memory cache while freshness catches up
//! asynchronously. It provides three things on top of a plain map:
//!
//! - **Request coalescing**: at most one fetch per cache key is in flight at
//!   any time. Concurrent callers for the same key all await the same shared
//!   fetch and observe the same result, success or failure.
//! - **Bounded-rate background refresh**: reads of stale entries enqueue the
//!   request on a FIFO queue that is drained by a background task, one fetch
//!   per tick, gated by a process-wide timestamp so a burst of distinct keys
//!   cannot exceed the upstream's rate limit. The gate is clamped by a
//!   maximum wait time so no key's refresh is pushed out indefinitely.
//! - **File-backed persistence**: whenever the background queue drains to
//!   empty, the cache map is written to a JSON file via the [`FileCache`]
//!   store and reloaded on the next construction. Persistence is best
//!   effort; a missing or corrupt file is simply an empty cache.
//!
//! Staleness is advisory: a stale entry is still served (and never evicted),
//! it merely triggers a background refresh. The only way an entry changes is
//! a successful fetch replacing it wholesale.
//!
//! Integration with the outside world happens exclusively through the
//! [`RefreshDriver`] trait: the driver derives cache keys from requests and
//! performs the actual fetch. The queue never inspects request or response
//! structure beyond that.
//!
//! Queues are independent instances; one is typically created per upstream,
//! each with its own configuration, cache file and log tag.

#![warn(missing_docs)]

mod config;
mod error;
mod file_cache;
mod queue;


pub use config::QueueConfig;
pub use error::{FetchError, FetchResult};
pub use file_cache::FileCache;
pub use queue::{CacheItem, QueueStatus, RefreshDriver, RefreshQueue};
