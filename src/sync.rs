//! Sync Engine - coordinates one run of the organization sync
//!
//! The engine owns the run deadline. It starts the lister as a producer task,
//! feeds every page it receives to the reconciler, and stops at whichever comes
//! first: the page channel closing or the deadline passing.

use crate::config::{Credentials, RunLimits, Settings};
use crate::git::{GitExecutor, SyncExecutor, SyncKind, SyncOutcome, SyncReport};
use crate::github::{GitHubClient, RepoSource};
use crate::inventory::LocalInventory;
use crate::lister::{ListingOutcome, RemoteLister};
use crate::reconcile::{PageReport, Reconciler};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Exit status when the run deadline was exceeded
pub const DEADLINE_EXIT_CODE: i32 = 2;

/// Stand-in for "no deadline" when a budget does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `from + budget`, saturating at a far-future instant instead of overflowing
pub fn deadline_after(from: Instant, budget: Duration) -> Instant {
    from.checked_add(budget)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// How the run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The page channel closed and every received page was reconciled
    Completed,
    /// The run deadline passed first
    DeadlineExceeded,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::DeadlineExceeded => DEADLINE_EXIT_CODE,
        }
    }
}

/// Results from a complete run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub listing: ListingOutcome,
    pub pages: Vec<PageReport>,
    pub duration: Duration,
}

impl RunSummary {
    pub fn reports(&self) -> impl Iterator<Item = &SyncReport> {
        self.pages.iter().flat_map(|page| page.reports.iter())
    }

    pub fn failures(&self) -> impl Iterator<Item = &SyncReport> {
        self.reports().filter(|report| !report.outcome.is_success())
    }

    pub fn dispatched(&self) -> usize {
        self.reports().count()
    }

    pub fn updated(&self) -> usize {
        self.reports()
            .filter(|report| report.outcome == SyncOutcome::Updated)
            .count()
    }

    pub fn acquired(&self) -> usize {
        self.reports()
            .filter(|report| report.outcome == SyncOutcome::Acquired)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.failures().count()
    }

    pub fn abandoned(&self) -> usize {
        self.pages.iter().map(|page| page.abandoned.len()).sum()
    }

    /// Names dispatched with the given kind, in completion order
    pub fn names_for(&self, kind: SyncKind) -> Vec<&str> {
        self.reports()
            .filter(|report| report.kind == kind)
            .map(|report| report.name.as_str())
            .collect()
    }
}

/// Runs the lister and reconciler against a single deadline
pub struct SyncEngine {
    org: String,
    limits: RunLimits,
    source: Arc<dyn RepoSource>,
    executor: Arc<dyn SyncExecutor>,
    inventory: Arc<LocalInventory>,
}

impl SyncEngine {
    pub fn new(
        org: impl Into<String>,
        limits: RunLimits,
        source: Arc<dyn RepoSource>,
        executor: Arc<dyn SyncExecutor>,
        inventory: Arc<LocalInventory>,
    ) -> Self {
        Self {
            org: org.into(),
            limits,
            source,
            executor,
            inventory,
        }
    }

    /// Wire the engine to GitHub and the local git binary
    pub fn connect(credentials: &Credentials, settings: &Settings, inventory: LocalInventory) -> Result<Self> {
        let client = GitHubClient::new(credentials)?;
        let executor = GitExecutor::with_settings(&credentials.repo_dir, &settings.git);

        Ok(Self::new(
            credentials.org.clone(),
            settings.limits(),
            Arc::new(client),
            Arc::new(executor),
            Arc::new(inventory),
        ))
    }

    pub fn limits(&self) -> &RunLimits {
        &self.limits
    }

    /// Run until the listing is drained or the run deadline passes
    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let deadline = deadline_after(started, self.limits.run_timeout);

        info!(
            "Starting sync of organization {} (deadline {:?})",
            self.org, self.limits.run_timeout
        );

        let (tx, mut rx) = mpsc::channel(self.limits.channel_capacity.max(1));
        let lister = RemoteLister::new(
            Arc::clone(&self.source),
            self.org.clone(),
            self.limits.per_page,
            self.limits.list_page_timeout,
            self.limits.retry.clone(),
        );
        let listing = tokio::spawn(lister.run(tx, deadline));

        let mut reconciler = Reconciler::new(
            Arc::clone(&self.inventory),
            Arc::clone(&self.executor),
            self.limits.repository_timeout,
            deadline,
        );
        let mut pages = Vec::new();

        let outcome = loop {
            tokio::select! {
                biased;

                _ = sleep_until(deadline) => {
                    error!("Run deadline of {:?} exceeded", self.limits.run_timeout);
                    break RunOutcome::DeadlineExceeded;
                }
                received = rx.recv() => match received {
                    Some(page) => {
                        debug!("Received page {} with {} repositories", page.number, page.repos.len());
                        pages.push(reconciler.reconcile(page).await);
                    }
                    None => break RunOutcome::Completed,
                },
            }
        };
        drop(rx);

        let listing = match outcome {
            RunOutcome::Completed => listing.await.context("Listing task failed")?,
            RunOutcome::DeadlineExceeded => {
                listing.abort();
                ListingOutcome::DeadlineExceeded {
                    pages: u32::try_from(pages.len()).unwrap_or(u32::MAX),
                }
            }
        };

        if let ListingOutcome::RateLimited { pages: listed } = listing {
            warn!(
                "Listing stopped by the GitHub rate limit after {} page(s); the run still counts as completed",
                listed
            );
        }

        let summary = RunSummary {
            outcome,
            listing,
            pages,
            duration: started.elapsed(),
        };

        info!(
            "Sync finished in {:.2}s: {} updated, {} acquired, {} failed, {} abandoned",
            summary.duration.as_secs_f64(),
            summary.updated(),
            summary.acquired(),
            summary.failed(),
            summary.abandoned()
        );

        Ok(summary)
    }
}
