//! Bounded polling for an artifact another worker is still producing.
//!
//! Estimator tasks may start while the transformer task of their case is still
//! running. The cache is the only channel between them, so the estimator polls for
//! the artifact. Under a non-raising policy the first expiry of the window is
//! treated as slow storage: one warning is emitted and the window restarts. The
//! second expiry is fatal, which bounds the wait to two windows.

use super::store::{CacheError, CacheStore};
use crate::diagnostics::{Diagnostics, Origin, Warning, WarningKind};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitPolicy {
    /// Pause between existence checks.
    pub interval: Duration,
    /// Length of one waiting window.
    pub limit: Duration,
    /// Fail as soon as the first read misses.
    pub raise_on_timeout: bool,
}

impl WaitPolicy {
    pub fn new(interval: Duration, limit: Duration, raise_on_timeout: bool) -> Self {
        Self {
            interval,
            limit,
            raise_on_timeout,
        }
    }
}

#[derive(Error, Debug)]
pub enum WaitError {
    #[error(
        "The cache entry '{key}' cannot be found after {waited:?} of waiting. Check that the \
         transformers fit quickly enough to complete before their estimators start, reduce \
         the preprocessing intensity, or increase the waiting limit."
    )]
    TimedOut { key: String, waited: Duration },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Returns the payload under `key`, polling the store until it appears.
pub fn await_artifact(
    store: &dyn CacheStore,
    key: &str,
    policy: &WaitPolicy,
    origin: &Origin,
    diagnostics: &dyn Diagnostics,
) -> Result<Vec<u8>, WaitError> {
    match store.load(key) {
        Ok(payload) => return Ok(payload),
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err.into()),
    }

    if policy.raise_on_timeout {
        return Err(WaitError::TimedOut {
            key: key.to_string(),
            waited: Duration::ZERO,
        });
    }

    log::debug!("{origin}Waiting for cache entry '{key}'");
    let started = Instant::now();
    let mut window = Instant::now();
    let mut escalated = false;
    while !store.exists(key) {
        thread::sleep(policy.interval);
        if window.elapsed() > policy.limit {
            if escalated {
                return Err(WaitError::TimedOut {
                    key: key.to_string(),
                    waited: started.elapsed(),
                });
            }
            diagnostics.warn(Warning::new(
                WarningKind::ParallelProcessing,
                origin,
                format!(
                    "Cache entry '{key}' not found. Will check every {:.1} seconds for {:.0} \
                     seconds before aborting.",
                    policy.interval.as_secs_f64(),
                    policy.limit.as_secs_f64()
                ),
            ));
            escalated = true;
            window = Instant::now();
        }
    }

    Ok(store.load(key)?)
}
