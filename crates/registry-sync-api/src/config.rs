//! Runtime configuration shared by the producer, applier and read surfaces.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::{BreakerPolicy, RetryPolicy};

pub const DEFAULT_DB_PATH: &str = "./registry_sync.sqlite3";
pub const DEFAULT_SOURCE_URL: &str = "https://ws-public.interpol.int/notices/v1/red";
pub const DEFAULT_NATIONALITY: &str = "US";
pub const DEFAULT_PAGE_SIZE: u32 = 160;
pub const DEFAULT_LIST_PAGE_SIZE: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Registry database.
    pub db_path: PathBuf,
    /// Database holding the durable delta queue; may be the registry database itself.
    pub queue_path: PathBuf,
    pub source_url: String,
    pub nationality: String,
    /// Records requested per listing page.
    pub page_size: u32,
    /// Pause between producer cycles.
    pub poll_interval: Duration,
    /// How long a received message stays invisible before it is redelivered.
    pub lease: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker: BreakerPolicy,
    pub list_page_size: u32,
}

impl SyncConfig {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        Self {
            queue_path: db_path.clone(),
            db_path,
            source_url: DEFAULT_SOURCE_URL.to_string(),
            nationality: DEFAULT_NATIONALITY.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            poll_interval: Duration::from_secs(2),
            lease: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            breaker: BreakerPolicy::default(),
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }

    #[must_use]
    pub fn with_queue_path(mut self, queue_path: impl Into<PathBuf>) -> Self {
        self.queue_path = queue_path.into();
        self
    }

    #[must_use]
    pub fn with_source_url(mut self, source_url: impl Into<String>) -> Self {
        self.source_url = source_url.into();
        self
    }

    #[must_use]
    pub fn with_nationality(mut self, nationality: impl Into<String>) -> Self {
        self.nationality = nationality.into();
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerPolicy) -> Self {
        self.breaker = breaker;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DB_PATH)
    }
}
