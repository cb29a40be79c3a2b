//! Asynchronous Sulpher query execution.
//!
//! Submissions either hit the canonical-query result cache (answered
//! immediately) or become jobs handed to a bounded worker pool. Workers run
//! against an edge-index snapshot taken at submission, so concurrent
//! writes never corrupt a running query. Any document write clears the
//! whole result cache.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;
use rserv_query::parser::Parser;
use rserv_query::planner::{QueryPlan, QueryPlanner};
use rserv_query::{ExecOptions, Executor};
use rserv_storage::graph::GraphSnapshot;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

const RESULT_CACHE_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub rows: usize,
    pub nodes_visited: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone)]
struct JobRecord {
    status: JobStatus,
    submitted_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<Vec<serde_json::Value>>,
    error: Option<JobError>,
    stats: Option<JobStats>,
}

/// Status endpoint view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<JobStats>,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Cache hit; answer with 200 and the stored rows.
    Cached { results: Vec<serde_json::Value> },
    /// New job; answer with 202 and the id to poll.
    Accepted { query_id: Uuid },
}

#[derive(Debug)]
pub enum JobResult {
    Completed { results: Vec<serde_json::Value> },
    Failed { error: JobError },
}

struct CacheEntry {
    rows: Vec<serde_json::Value>,
    stored_at: Instant,
}

struct WorkItem {
    job_id: Uuid,
    canonical: String,
    plan: QueryPlan,
    snapshot: GraphSnapshot,
    max_depth: u32,
}

struct Inner {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    timeout: Duration,
}

impl Inner {
    fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }
}

pub struct JobManager {
    inner: Arc<Inner>,
    tx: Option<mpsc::Sender<WorkItem>>,
    workers: Vec<JoinHandle<()>>,
}

impl JobManager {
    pub fn new(worker_count: usize, ttl: Duration, timeout: Duration) -> Self {
        let inner = Arc::new(Inner {
            jobs: Mutex::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(RESULT_CACHE_CAPACITY).unwrap(),
            )),
            ttl,
            timeout,
        });
        let (tx, rx) = mpsc::channel::<WorkItem>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..worker_count.max(1))
            .map(|_| {
                let inner = inner.clone();
                let rx = rx.clone();
                std::thread::spawn(move || {
                    loop {
                        let item = rx.lock().unwrap().recv();
                        match item {
                            Ok(item) => run_job(&inner, item),
                            Err(_) => break,
                        }
                    }
                })
            })
            .collect();
        Self {
            inner,
            tx: Some(tx),
            workers,
        }
    }

    /// Parse-and-plan happens here so syntax errors fail the submission
    /// synchronously instead of surfacing on the first poll.
    pub fn submit(
        &self,
        query: &str,
        max_depth: u32,
        snapshot: GraphSnapshot,
    ) -> Result<SubmitOutcome> {
        let canonical = canonicalize(query);
        self.purge_expired();
        if let Some(results) = self.cached(&canonical) {
            debug!(canonical, "graph query cache hit");
            return Ok(SubmitOutcome::Cached { results });
        }

        let parsed = Parser::parse(query).map_err(Error::from)?;
        let plan = QueryPlanner::new().plan(parsed).map_err(Error::from)?;

        let query_id = Uuid::new_v4();
        self.inner.jobs.lock().unwrap().insert(
            query_id,
            JobRecord {
                status: JobStatus::Pending,
                submitted_at: Utc::now(),
                finished_at: None,
                result: None,
                error: None,
                stats: None,
            },
        );
        let item = WorkItem {
            job_id: query_id,
            canonical,
            plan,
            snapshot,
            max_depth,
        };
        self.tx
            .as_ref()
            .expect("job manager is live")
            .send(item)
            .map_err(|_| Error::Storage("query worker pool is gone".to_string()))?;
        debug!(%query_id, "graph query accepted");
        Ok(SubmitOutcome::Accepted { query_id })
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatusView> {
        let jobs = self.inner.jobs.lock().unwrap();
        jobs.get(&id).map(|job| JobStatusView {
            status: job.status,
            submitted_at: job.submitted_at,
            finished_at: job.finished_at,
            stats: job.stats.clone(),
        })
    }

    /// Terminal results only; polling a live job is a `Conflict`.
    pub fn result(&self, id: Uuid) -> Result<JobResult> {
        let jobs = self.inner.jobs.lock().unwrap();
        let Some(job) = jobs.get(&id) else {
            return Err(Error::NotFound(format!("no graph query job {id}")));
        };
        match job.status {
            JobStatus::Pending | JobStatus::Running => Err(Error::Conflict(format!(
                "graph query job {id} is not finished"
            ))),
            JobStatus::Completed => Ok(JobResult::Completed {
                results: job.result.clone().unwrap_or_default(),
            }),
            JobStatus::Failed => Ok(JobResult::Failed {
                error: job.error.clone().unwrap_or(JobError {
                    kind: "StorageError".to_string(),
                    message: "job failed without detail".to_string(),
                }),
            }),
        }
    }

    /// Write invalidation: drop every cached result.
    pub fn invalidate_all(&self) {
        self.inner.clear_cache();
    }

    /// Invalidation hook for the store's subscriber list.
    pub fn invalidation_hook(&self) -> Box<dyn Fn(&str, rserv_api::DocId) + Send + Sync> {
        let inner = self.inner.clone();
        Box::new(move |_entity, _id| inner.clear_cache())
    }

    fn cached(&self, canonical: &str) -> Option<Vec<serde_json::Value>> {
        let mut cache = self.inner.cache.lock().unwrap();
        match cache.get(canonical) {
            Some(entry) if entry.stored_at.elapsed() < self.inner.ttl => {
                Some(entry.rows.clone())
            }
            Some(_) => {
                cache.pop(canonical);
                None
            }
            None => None,
        }
    }

    /// Drops terminal job records older than the TTL.
    fn purge_expired(&self) {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.inner.ttl).unwrap_or(chrono::Duration::zero());
        self.inner.jobs.lock().unwrap().retain(|_, job| {
            match (job.status, job.finished_at) {
                (JobStatus::Completed | JobStatus::Failed, Some(done)) => now - done <= ttl,
                _ => true,
            }
        });
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn run_job(inner: &Inner, item: WorkItem) {
    {
        let mut jobs = inner.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&item.job_id) {
            job.status = JobStatus::Running;
        }
    }

    let started = Instant::now();
    let opts = ExecOptions {
        max_depth: item.max_depth,
        deadline: Some(started + inner.timeout),
    };
    let outcome = Executor::new(&item.snapshot, opts).execute(&item.plan);
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut jobs = inner.jobs.lock().unwrap();
    let Some(job) = jobs.get_mut(&item.job_id) else {
        return;
    };
    job.finished_at = Some(Utc::now());
    match outcome {
        Ok(output) => {
            let rows: Vec<serde_json::Value> =
                output.rows.iter().map(|row| row.to_json()).collect();
            job.status = JobStatus::Completed;
            job.stats = Some(JobStats {
                rows: rows.len(),
                nodes_visited: output.nodes_visited,
                elapsed_ms,
            });
            job.result = Some(rows.clone());
            drop(jobs);
            inner.cache.lock().unwrap().put(
                item.canonical,
                CacheEntry {
                    rows,
                    stored_at: Instant::now(),
                },
            );
        }
        Err(e) => {
            let error: Error = e.into();
            job.status = JobStatus::Failed;
            job.stats = Some(JobStats {
                rows: 0,
                nodes_visited: 0,
                elapsed_ms,
            });
            job.error = Some(JobError {
                kind: error.kind().to_string(),
                message: error.to_string(),
            });
        }
    }
}

/// Cache key: whitespace runs collapse to one space; everything outside
/// string literals is case-folded, literals stay byte-for-byte.
pub fn canonicalize(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut in_string: Option<char> = None;
    let mut pending_space = false;
    for c in query.chars() {
        if let Some(quote) = in_string {
            out.push(c);
            if c == quote {
                in_string = None;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        if c == '\'' || c == '"' {
            in_string = Some(c);
            out.push(c);
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_folds_case_outside_literals() {
        assert_eq!(
            canonicalize("MATCH  (u:User)\n  WHERE u.name = 'Alice'  RETURN u"),
            "match (u:user) where u.name = 'Alice' return u"
        );
        assert_eq!(
            canonicalize("match (u:user) where u.name = 'Alice' return u"),
            canonicalize("MATCH (u:User) WHERE u.name = 'Alice' RETURN u")
        );
        assert_ne!(
            canonicalize("MATCH (u) WHERE u.name = 'alice' RETURN u"),
            canonicalize("MATCH (u) WHERE u.name = 'Alice' RETURN u")
        );
    }
}
