use std::time::Duration;

use clap::Args;

const DEFAULT_RESYNC_SECS: u64 = 300;
const DEFAULT_ERROR_BACKOFF_BASE_MS: u64 = 5_000;
const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 300;
const DEFAULT_CONCURRENCY: u16 = 2;
const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 30;

/// Runtime settings of the controllers.
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Seconds after which a successfully reconciled object is visited again
    #[arg(long, env = "SECRET_SYNC_RESYNC_SECS", default_value_t = DEFAULT_RESYNC_SECS)]
    pub resync_secs: u64,

    /// Delay before the first retry of a failed reconcile, doubled on every further failure
    #[arg(
        long,
        env = "SECRET_SYNC_ERROR_BACKOFF_BASE_MS",
        default_value_t = DEFAULT_ERROR_BACKOFF_BASE_MS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub error_backoff_base_ms: u64,

    /// Upper bound for the retry delay of a failing object
    #[arg(long, env = "SECRET_SYNC_ERROR_BACKOFF_MAX_SECS", default_value_t = DEFAULT_ERROR_BACKOFF_MAX_SECS)]
    pub error_backoff_max_secs: u64,

    /// Reconciles each controller runs at the same time
    #[arg(
        long,
        env = "SECRET_SYNC_CONCURRENCY",
        default_value_t = DEFAULT_CONCURRENCY,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub concurrency: u16,

    /// Seconds a single reconcile may take before it is abandoned and retried
    #[arg(long, env = "SECRET_SYNC_RECONCILE_TIMEOUT_SECS", default_value_t = DEFAULT_RECONCILE_TIMEOUT_SECS)]
    pub reconcile_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resync_secs: DEFAULT_RESYNC_SECS,
            error_backoff_base_ms: DEFAULT_ERROR_BACKOFF_BASE_MS,
            error_backoff_max_secs: DEFAULT_ERROR_BACKOFF_MAX_SECS,
            concurrency: DEFAULT_CONCURRENCY,
            reconcile_timeout_secs: DEFAULT_RECONCILE_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn error_backoff_base(&self) -> Duration {
        Duration::from_millis(self.error_backoff_base_ms)
    }

    pub fn error_backoff_max(&self) -> Duration {
        Duration::from_secs(self.error_backoff_max_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }
}
