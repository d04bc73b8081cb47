//! Runs a single work function at a bounded frequency.
//!
//! Runs are requested through a [`Trigger`], which may be cloned and used from any task. The
//! runner decouples the rate of requests from the rate of runs:
//!
//! - Requests made while a run is pending coalesce into that run.
//! - Runs consume tokens from a bucket that holds at most `burst` tokens and gains one token per
//!   `min_period`. The bucket starts with a single token, so only an idle runner can burst.
//! - When no run has happened for `max_period`, a run is forced even if none was requested.
//!
//! A run that fails is reported and is not retried until the next regular run.

use crate::{Error, ErrorSink};
use governor::{
    clock::Clock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{future::Future, num::NonZeroU32, sync::Arc, time::Instant as StdInstant};
use tokio::{
    sync::Notify,
    time::{self, Duration, Instant},
};
use tracing::{debug, trace};

#[cfg(test)]
mod tests;

/// Bounds periods, and the time a full bucket takes to fill, to what the clocks can represent.
const MAX_PERIOD: Duration = Duration::from_nanos(u64::MAX);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Params {
    /// The minimum time between runs, except when bursting.
    pub min_period: Duration,

    /// The maximum time between runs.
    pub max_period: Duration,

    /// The number of runs that may happen back-to-back after the runner has been idle.
    pub burst: NonZeroU32,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidParams {
    #[error("max period must be non-zero")]
    ZeroMaxPeriod,

    #[error("min period {min:?} exceeds max period {max:?}")]
    MinExceedsMax { min: Duration, max: Duration },

    #[error("max period {0:?} is out of range")]
    MaxOutOfRange(Duration),

    #[error("min period {min:?} is out of range for a burst of {burst}")]
    BurstOutOfRange { min: Duration, burst: NonZeroU32 },
}

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    requests: Counter,
    runs: Counter,
    failures: Counter,
}

/// Requests runs from a [`BoundedFrequency`] runner.
#[derive(Clone, Debug)]
pub struct Trigger {
    notify: Arc<Notify>,
    requests: Counter,
}

#[derive(Debug)]
pub struct BoundedFrequency {
    name: &'static str,
    params: Params,
    notify: Arc<Notify>,
    metrics: Metrics,
}

/// Run tokens. `None` when runs are not spaced at all.
struct Tokens(Option<Limiter>);

type Limiter = RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<StdInstant>>;

/// Reads time from tokio so that paused test runtimes drive the bucket.
#[derive(Copy, Clone, Debug, Default)]
struct TokioClock;

// === impl Params ===

impl Params {
    pub fn validate(&self) -> Result<(), InvalidParams> {
        if self.max_period.is_zero() {
            return Err(InvalidParams::ZeroMaxPeriod);
        }
        if self.min_period > self.max_period {
            return Err(InvalidParams::MinExceedsMax {
                min: self.min_period,
                max: self.max_period,
            });
        }
        if self.max_period > MAX_PERIOD {
            return Err(InvalidParams::MaxOutOfRange(self.max_period));
        }
        let span = self.min_period.checked_mul(self.burst.get());
        if !span.is_some_and(|span| span <= MAX_PERIOD) {
            return Err(InvalidParams::BurstOutOfRange {
                min: self.min_period,
                burst: self.burst,
            });
        }
        Ok(())
    }
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Counter::default();
        reg.register(
            "requests",
            "Count of requested runs, including coalesced requests",
            requests.clone(),
        );

        let runs = Counter::default();
        reg.register("runs", "Count of runs started", runs.clone());

        let failures = Counter::default();
        reg.register("failures", "Count of runs that failed", failures.clone());

        Self {
            requests,
            runs,
            failures,
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.get()
    }

    pub fn runs(&self) -> u64 {
        self.runs.get()
    }

    pub fn failures(&self) -> u64 {
        self.failures.get()
    }
}

// === impl Trigger ===

impl Trigger {
    /// Requests a run without waiting for it.
    ///
    /// If a run is already pending, this request is satisfied by that run.
    pub fn request_run(&self) {
        self.requests.inc();
        self.notify.notify_one();
    }
}

// === impl BoundedFrequency ===

impl BoundedFrequency {
    pub fn new(
        name: &'static str,
        params: Params,
        metrics: Metrics,
    ) -> Result<Self, InvalidParams> {
        params.validate()?;
        Ok(Self {
            name,
            params,
            notify: Arc::new(Notify::new()),
            metrics,
        })
    }

    pub fn trigger(&self) -> Trigger {
        Trigger {
            notify: self.notify.clone(),
            requests: self.metrics.requests.clone(),
        }
    }

    /// Runs `work` as requested until `shutdown` is signaled.
    ///
    /// A run that is in progress when shutdown is signaled is dropped before it completes.
    pub async fn run<F, Fut>(self, mut work: F, errors: Arc<dyn ErrorSink>, shutdown: drain::Watch)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let Self {
            name,
            params,
            notify,
            metrics,
        } = self;

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        let tokens = Tokens::new(params.burst, params.min_period);
        let mut forced_at = Instant::now() + params.max_period;
        let mut retry_at = None::<Instant>;
        let mut pending = false;

        debug!(name, ?params, "Starting");
        loop {
            let wake_at = retry_at.map_or(forced_at, |at| at.min(forced_at));
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!(name, "Shutdown");
                    return;
                }

                () = notify.notified() => {
                    trace!(name, pending, "Run requested");
                    pending = true;
                }

                () = time::sleep_until(wake_at) => {
                    if Instant::now() >= forced_at {
                        trace!(name, "Max period elapsed");
                        pending = true;
                    }
                }
            }

            if !pending {
                continue;
            }

            if let Err(delay) = tokens.try_take() {
                trace!(name, ?delay, "Deferring run");
                retry_at = Some(Instant::now() + delay);
                continue;
            }
            pending = false;
            retry_at = None;

            metrics.runs.inc();
            debug!(name, "Running");
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!(name, "Shutdown; abandoning run");
                    return;
                }

                res = work() => {
                    if let Err(source) = res {
                        metrics.failures.inc();
                        errors.report(Error::SyncFailed { runner: name, source });
                    }
                }
            }
            forced_at = Instant::now() + params.max_period;
        }
    }
}

// === impl Tokens ===

impl Tokens {
    /// The bucket holds at most `burst` tokens and gains one per `period`. It starts with a single
    /// token.
    fn new(burst: NonZeroU32, period: Duration) -> Self {
        let Some(quota) = Quota::with_period(period) else {
            return Self(None);
        };
        let limiter = RateLimiter::direct_with_clock(quota.allow_burst(burst), &TokioClock);
        if let Some(spent) = NonZeroU32::new(burst.get() - 1) {
            let _ = limiter.check_n(spent);
        }
        Self(Some(limiter))
    }

    /// Takes a token, or returns how long until one is available.
    fn try_take(&self) -> Result<(), Duration> {
        match &self.0 {
            None => Ok(()),
            Some(limiter) => limiter
                .check()
                .map_err(|not_until| not_until.wait_time_from(TokioClock.now())),
        }
    }
}

// === impl TokioClock ===

impl Clock for TokioClock {
    type Instant = StdInstant;

    fn now(&self) -> StdInstant {
        Instant::now().into_std()
    }
}
