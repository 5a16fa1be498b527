use std::time::Duration;

use thiserror::Error;

/// An error produced while fetching fresh data from an upstream.
///
/// Fetch results are shared between all callers joined on the same in-flight
/// fetch, so this type must be cheap to clone; error details are flattened
/// into strings.
///
/// A failed fetch never modifies the cache: the previously cached value (if
/// any) stays retrievable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The upstream responded, but with a non-success status code.
    #[error("upstream responded with status {0}")]
    Status(u16),

    /// The request to the upstream failed altogether, e.g. connection loss
    /// or DNS resolution.
    ///
    /// The attached string contains the underlying error message.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// The upstream responded successfully, but the payload could not be
    /// interpreted.
    #[error("malformed upstream response: {0}")]
    Malformed(String),

    /// A driver-imposed deadline elapsed before the upstream responded.
    ///
    /// The queue itself never bounds a fetch; drivers that wrap their future
    /// in a timeout use this variant to express it.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The task driving the fetch went away before producing a result.
    #[error("fetch task was canceled")]
    Canceled,
}

impl FetchError {
    /// Flattens an arbitrary error into [`FetchError::Upstream`], logging it
    /// with full detail first.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "upstream fetch error");
        Self::Upstream(e.to_string())
    }
}

/// Shorthand for results of a fetch, shared by all coalesced callers.
pub type FetchResult<T = ()> = Result<T, FetchError>;
