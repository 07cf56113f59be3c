//! Reconciler - turns one page of remote repositories into concurrent sync tasks
//!
//! Every repository of a page is dispatched onto a [`JoinSet`] without waiting
//! for the previous one, and the page is only reported once all of them have
//! finished. Pages themselves are reconciled one at a time by the caller.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::git::{SyncExecutor, SyncKind, SyncReport, SyncTask};
use crate::github::RepoPage;
use crate::inventory::LocalInventory;
use crate::sync::deadline_after;

/// Everything that happened to one page
#[derive(Debug, Clone, Default)]
pub struct PageReport {
    pub page: u32,
    pub reports: Vec<SyncReport>,
    /// Never dispatched because the deadline had already passed
    pub abandoned: Vec<String>,
    /// Already dispatched earlier in this run
    pub duplicates: Vec<String>,
}

impl PageReport {
    pub fn dispatched(&self) -> usize {
        self.reports.len()
    }
}

pub struct Reconciler {
    inventory: Arc<LocalInventory>,
    executor: Arc<dyn SyncExecutor>,
    repository_timeout: Duration,
    run_deadline: Instant,
    dispatched: HashSet<String>,
}

impl Reconciler {
    pub fn new(
        inventory: Arc<LocalInventory>,
        executor: Arc<dyn SyncExecutor>,
        repository_timeout: Duration,
        run_deadline: Instant,
    ) -> Self {
        Self {
            inventory,
            executor,
            repository_timeout,
            run_deadline,
            dispatched: HashSet::new(),
        }
    }

    /// Update when the name is a local directory, acquire otherwise
    pub fn classify(&self, name: &str) -> SyncKind {
        if self.inventory.contains_repo(name) {
            SyncKind::Update
        } else {
            SyncKind::Acquire
        }
    }

    /// Per-repository deadline, never later than the run deadline
    fn task_deadline(&self) -> Instant {
        deadline_after(Instant::now(), self.repository_timeout).min(self.run_deadline)
    }

    /// Dispatch every repository of `page` concurrently and wait for all of them
    pub async fn reconcile(&mut self, page: RepoPage) -> PageReport {
        let mut report = PageReport {
            page: page.number,
            ..Default::default()
        };
        let mut tasks: JoinSet<SyncReport> = JoinSet::new();

        let mut repos = page.repos.into_iter();
        while let Some(repo) = repos.next() {
            let deadline = self.task_deadline();
            if Instant::now() >= deadline {
                warn!(
                    "Deadline exceeded for repo {}, abandoning the rest of page {}",
                    repo.name, page.number
                );
                report.abandoned.push(repo.name);
                report.abandoned.extend(repos.map(|r| r.name));
                break;
            }

            if !self.dispatched.insert(repo.name.clone()) {
                warn!("Repository {} already synced in this run, skipping", repo.name);
                report.duplicates.push(repo.name);
                continue;
            }

            let kind = self.classify(&repo.name);
            debug!("Dispatching {} for {}", kind, repo.name);

            let executor = Arc::clone(&self.executor);
            let task = SyncTask {
                kind,
                repo,
                deadline,
            };
            tasks.spawn(async move { executor.execute(task).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(sync_report) => report.reports.push(sync_report),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => error!("Sync task was cancelled: {}", e),
            }
        }

        info!(
            "Page {} reconciled: {} dispatched, {} abandoned",
            report.page,
            report.dispatched(),
            report.abandoned.len()
        );
        report
    }
}
