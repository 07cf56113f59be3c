//! Common fakes and helpers for orgsync integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use orgsync::git::SyncFailure;
use orgsync::inventory::LocalEntry;
use orgsync::{
    ListError, LocalInventory, RemoteRepo, RepoPage, RepoSource, RetryPolicy, RunLimits, SyncExecutor,
    SyncKind, SyncOutcome, SyncReport, SyncTask,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::time::{sleep, timeout_at, Instant};

/// What the fake source answers for one page number
#[derive(Debug, Clone)]
pub enum PageScript {
    Repos(Vec<String>),
    RateLimited,
    Broken,
}

/// Repository source serving a fixed script of pages
pub struct ScriptedSource {
    pages: HashMap<u32, PageScript>,
    last_page: u32,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(pages: Vec<PageScript>) -> Self {
        let last_page = pages.len() as u32;
        Self {
            pages: (1..).zip(pages).collect(),
            last_page,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepoSource for ScriptedSource {
    async fn list_page(&self, org: &str, page: u32, _per_page: u8) -> Result<RepoPage, ListError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.pages.get(&page) {
            Some(PageScript::Repos(names)) => Ok(RepoPage {
                number: page,
                repos: names
                    .iter()
                    .map(|name| RemoteRepo::new(org, name.clone()))
                    .collect(),
                next_page: (page < self.last_page).then_some(page + 1),
            }),
            Some(PageScript::RateLimited) => Err(ListError::RateLimited("API rate limit exceeded".to_string())),
            Some(PageScript::Broken) | None => Err(ListError::Api("502 Bad Gateway".to_string())),
        }
    }
}

/// Executor recording every task it receives
pub struct FakeExecutor {
    seen: Mutex<Vec<(String, SyncKind)>>,
    delay: Duration,
    delays: HashMap<String, Duration>,
    barrier: Option<Barrier>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            delays: HashMap::new(),
            barrier: None,
        }
    }

    /// Every task takes `delay`, cut short by its deadline
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The task for `name` takes `delay` instead of the shared one
    pub fn with_delay_for(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    /// Tasks wait until `parties` of them are in flight together
    pub fn with_barrier(mut self, parties: usize) -> Self {
        self.barrier = Some(Barrier::new(parties));
        self
    }

    pub fn seen(&self) -> Vec<(String, SyncKind)> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        seen
    }
}

#[async_trait]
impl SyncExecutor for FakeExecutor {
    async fn execute(&self, task: SyncTask) -> SyncReport {
        let started = Instant::now();
        self.seen
            .lock()
            .unwrap()
            .push((task.repo.name.clone(), task.kind));

        let delay = self.delays.get(&task.repo.name).copied().unwrap_or(self.delay);
        let work = async {
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            sleep(delay).await;
        };

        let outcome = match timeout_at(task.deadline, work).await {
            Ok(()) => match task.kind {
                SyncKind::Update => SyncOutcome::Updated,
                SyncKind::Acquire => SyncOutcome::Acquired,
            },
            Err(_) => SyncOutcome::Failed(SyncFailure::DeadlineExceeded),
        };

        SyncReport {
            name: task.repo.name,
            kind: task.kind,
            outcome,
            elapsed: started.elapsed(),
        }
    }
}

pub fn names(names: &[&str]) -> PageScript {
    PageScript::Repos(names.iter().map(|name| name.to_string()).collect())
}

pub fn inventory(dirs: &[&str]) -> Arc<LocalInventory> {
    let entries = dirs
        .iter()
        .map(|name| LocalEntry {
            name: name.to_string(),
            is_dir: true,
        })
        .collect();
    Arc::new(LocalInventory::from_entries("/repos", entries))
}

/// Default limits without retry delays
pub fn limits() -> RunLimits {
    RunLimits {
        retry: RetryPolicy::none(),
        ..RunLimits::default()
    }
}
