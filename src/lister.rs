//! Remote Lister - streams the organization listing into the page channel
//!
//! The lister is the only owner of the channel's `Sender`, so the channel is
//! closed exactly once: when [`RemoteLister::run`] returns, whatever the reason.

use backon::{ExponentialBuilder, Retryable};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::github::{ListError, RepoPage, RepoSource};
use crate::sync::deadline_after;

/// Bounded retry for non rate-limit listing errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Minimum delay between retries.
    pub min_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Maximum number of retry attempts after the first request.
    pub max_retries: usize,
    /// Whether to add jitter to delays.
    pub with_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 3)
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(min_delay: Duration, max_delay: Duration, max_retries: usize) -> Self {
        Self {
            min_delay,
            max_delay,
            max_retries,
            with_jitter: true,
        }
    }

    /// No retries at all
    #[must_use]
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 0)
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.with_jitter = jitter;
        self
    }

    /// Build an exponential backoff strategy from this policy.
    #[must_use]
    pub fn into_backoff(self) -> ExponentialBuilder {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries);

        if self.with_jitter {
            builder = builder.with_jitter();
        }

        builder
    }
}

/// Why the lister stopped producing pages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingOutcome {
    /// The last page reported no further pages
    Exhausted { pages: u32 },
    /// The remote service signalled its rate limit
    RateLimited { pages: u32 },
    /// The run deadline expired before the listing finished
    DeadlineExceeded { pages: u32 },
    /// A page kept failing after every retry
    Failed { pages: u32, reason: String },
    /// The consumer dropped its receiver
    ReceiverClosed { pages: u32 },
}

impl ListingOutcome {
    /// Pages emitted onto the channel
    pub fn pages(&self) -> u32 {
        match self {
            ListingOutcome::Exhausted { pages }
            | ListingOutcome::RateLimited { pages }
            | ListingOutcome::DeadlineExceeded { pages }
            | ListingOutcome::Failed { pages, .. }
            | ListingOutcome::ReceiverClosed { pages } => *pages,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ListingOutcome::Exhausted { .. })
    }
}

/// Producer side of the pipeline
pub struct RemoteLister {
    source: Arc<dyn RepoSource>,
    org: String,
    per_page: u8,
    page_timeout: Duration,
    retry: RetryPolicy,
}

impl RemoteLister {
    pub fn new(
        source: Arc<dyn RepoSource>,
        org: impl Into<String>,
        per_page: u8,
        page_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            org: org.into(),
            per_page,
            page_timeout,
            retry,
        }
    }

    /// Publish every page onto `tx` until the listing ends or fails.
    ///
    /// Consumes `tx`; the channel closes when this returns.
    pub async fn run(self, tx: mpsc::Sender<RepoPage>, run_deadline: Instant) -> ListingOutcome {
        let mut page = 1u32;
        let mut emitted = 0u32;

        loop {
            if Instant::now() >= run_deadline {
                error!("Listing for {} stopped: run deadline exceeded", self.org);
                return ListingOutcome::DeadlineExceeded { pages: emitted };
            }

            match self.fetch_with_retry(page, run_deadline).await {
                Ok(repo_page) => {
                    let next_page = repo_page.next_page;
                    debug!(
                        "Publishing page {} with {} repositories",
                        repo_page.number,
                        repo_page.repos.len()
                    );

                    if tx.send(repo_page).await.is_err() {
                        warn!("Page receiver closed, stopping listing for {}", self.org);
                        return ListingOutcome::ReceiverClosed { pages: emitted };
                    }
                    emitted += 1;

                    match next_page {
                        Some(next) => page = next,
                        None => {
                            info!("Listed {} page(s) for organization {}", emitted, self.org);
                            return ListingOutcome::Exhausted { pages: emitted };
                        }
                    }
                }
                Err(ListError::RateLimited(message)) => {
                    error!(
                        "Hit GitHub API rate limit on page {} for {}: {}",
                        page, self.org, message
                    );
                    return ListingOutcome::RateLimited { pages: emitted };
                }
                Err(ListError::DeadlineExceeded) => {
                    error!(
                        "Listing for {} stopped on page {}: run deadline exceeded",
                        self.org, page
                    );
                    return ListingOutcome::DeadlineExceeded { pages: emitted };
                }
                Err(e) => {
                    error!(
                        "Giving up listing {} at page {} after {} retries: {}",
                        self.org, page, self.retry.max_retries, e
                    );
                    return ListingOutcome::Failed {
                        pages: emitted,
                        reason: e.to_string(),
                    };
                }
            }
        }
    }

    async fn fetch_with_retry(&self, page: u32, run_deadline: Instant) -> Result<RepoPage, ListError> {
        let fetch = || self.fetch_page(page, run_deadline);

        fetch
            .retry(self.retry.clone().into_backoff())
            .when(ListError::is_retryable)
            .notify(|err: &ListError, dur: Duration| {
                warn!("Listing page {} failed, retrying in {:?}: {}", page, dur, err);
            })
            .await
    }

    /// One request, bounded by the page timeout and never past the run deadline
    async fn fetch_page(&self, page: u32, run_deadline: Instant) -> Result<RepoPage, ListError> {
        if Instant::now() >= run_deadline {
            return Err(ListError::DeadlineExceeded);
        }

        let page_deadline = deadline_after(Instant::now(), self.page_timeout).min(run_deadline);
        let request = self.source.list_page(&self.org, page, self.per_page);

        match timeout_at(page_deadline, request).await {
            Ok(result) => result,
            Err(_) if Instant::now() >= run_deadline => Err(ListError::DeadlineExceeded),
            Err(_) => Err(ListError::Timeout(self.page_timeout)),
        }
    }
}
