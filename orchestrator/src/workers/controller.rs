//! Work queue driven controller for one resource kind
//!
//! Names arrive from the watcher. The controller keeps at most one pass per
//! name in flight; a name that changes while its pass runs is queued again
//! once the pass ends. Passes that ask to be looked at later, or that fail
//! with a retryable error, are parked until their delay expires.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::errors::{OrchestratorError, RetryPolicy};
use crate::reconcile::Action;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Controller options
#[derive(Debug, Clone)]
pub struct Options {
    /// Kind name used in logs
    pub kind: String,

    /// Passes allowed to run at the same time
    pub concurrency: usize,

    /// Error backoff
    pub backoff: CooldownOptions,

    /// Upper bound on how long the loop sleeps with nothing parked
    pub idle_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            kind: "resource".to_string(),
            concurrency: 4,
            backoff: CooldownOptions {
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(300),
                multiplier: 2.0,
            },
            idle_interval: Duration::from_secs(60),
        }
    }
}

/// Queue bookkeeping, owned by the controller loop
#[derive(Debug, Default)]
pub struct QueueState {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    running: HashSet<String>,
    dirty: HashSet<String>,
    parked: BTreeMap<String, Instant>,
    failures: HashMap<String, u32>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `name` for a pass as soon as a worker is free
    pub fn push(&mut self, name: String) {
        if self.running.contains(&name) {
            self.dirty.insert(name);
            return;
        }
        if self.queued.insert(name.clone()) {
            self.ready.push_back(name);
        }
    }

    /// Queue `name` once `delay` has passed; an earlier deadline wins
    pub fn park(&mut self, name: String, delay: Duration, now: Instant) {
        let due = now + delay;
        self.parked
            .entry(name)
            .and_modify(|d| *d = (*d).min(due))
            .or_insert(due);
    }

    /// Move every parked name whose deadline passed to the ready queue
    pub fn promote_due(&mut self, now: Instant) {
        let due: Vec<String> = self
            .parked
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in due {
            self.parked.remove(&name);
            self.push(name);
        }
    }

    /// Time until the next parked deadline
    pub fn next_due(&self, now: Instant) -> Option<Duration> {
        self.parked
            .values()
            .min()
            .map(|at| at.saturating_duration_since(now))
    }

    /// Take the next name to run and mark it running
    pub fn start_next(&mut self) -> Option<String> {
        let name = self.ready.pop_front()?;
        self.queued.remove(&name);
        self.parked.remove(&name);
        self.running.insert(name.clone());
        Some(name)
    }

    /// A pass for `name` ended; returns true when it was requeued because a
    /// change arrived meanwhile
    pub fn finish(&mut self, name: &str) -> bool {
        self.running.remove(name);
        if self.dirty.remove(name) {
            self.push(name.to_string());
            return true;
        }
        false
    }

    /// Count a failure and return how many came in a row
    pub fn record_failure(&mut self, name: &str) -> u32 {
        let attempts = self.failures.entry(name.to_string()).or_insert(0);
        *attempts += 1;
        *attempts
    }

    pub fn reset_failures(&mut self, name: &str) {
        self.failures.remove(name);
    }

    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.running.is_empty()
    }
}

/// Where a finished pass sends its name next
fn settle(
    options: &Options,
    queue: &mut QueueState,
    name: String,
    outcome: Result<Action, OrchestratorError>,
    now: Instant,
) {
    let requeued = queue.finish(&name);

    match outcome {
        Ok(action) => {
            queue.reset_failures(&name);
            if let Some(delay) = action.requeue_after() {
                debug!(kind = %options.kind, name = %name, "requeue in {:?}", delay);
                queue.park(name, delay, now);
            }
        }
        Err(err) => match err.retry_policy() {
            RetryPolicy::Immediate => {
                debug!(kind = %options.kind, name = %name, "retrying after conflict: {}", err);
                queue.record_failure(&name);
                if !requeued {
                    queue.push(name);
                }
            }
            RetryPolicy::Backoff => {
                let attempts = queue.record_failure(&name);
                let delay = calc_exp_backoff(&options.backoff, attempts.saturating_sub(1));
                warn!(
                    kind = %options.kind, name = %name,
                    "pass failed (attempt {}), retrying in {:?}: {}", attempts, delay, err
                );
                queue.park(name, delay, now);
            }
            RetryPolicy::AwaitChange => {
                queue.reset_failures(&name);
                error!(kind = %options.kind, name = %name, "pass failed, waiting for a change: {}", err);
            }
        },
    }
}

/// Run the controller until shutdown.
///
/// `reconcile` runs one pass for a name. In-flight passes are awaited
/// before returning.
pub async fn run<R, Fut, S, F>(
    options: &Options,
    mut names: mpsc::UnboundedReceiver<String>,
    reconcile: R,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    R: Fn(String) -> Fut,
    Fut: Future<Output = Result<Action, OrchestratorError>> + Send + 'static,
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("{} controller starting...", options.kind);

    let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut queue = QueueState::new();
    let mut tasks: JoinSet<(String, Result<Action, OrchestratorError>)> = JoinSet::new();
    let mut inputs_open = true;

    loop {
        // Start as many passes as there are free workers
        while let Ok(permit) = permits.clone().try_acquire_owned() {
            let Some(name) = queue.start_next() else {
                break;
            };
            debug!(kind = %options.kind, name = %name, "starting pass");
            let pass = reconcile(name.clone());
            tasks.spawn(async move {
                let _permit = permit;
                // A panicking pass still hands its name back to the queue
                let outcome = match tokio::spawn(pass).await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(OrchestratorError::Internal(format!("pass panicked: {e}"))),
                };
                (name, outcome)
            });
        }

        let wait = queue
            .next_due(Instant::now())
            .unwrap_or(options.idle_interval)
            .min(options.idle_interval);

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("{} controller shutting down...", options.kind);
                break;
            }
            received = names.recv(), if inputs_open => {
                match received {
                    Some(name) => queue.push(name),
                    None => inputs_open = false,
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                match joined {
                    Ok((name, outcome)) => settle(options, &mut queue, name, outcome, Instant::now()),
                    Err(e) => error!("{} pass panicked: {}", options.kind, e),
                }
            }
            _ = sleep_fn(wait) => {}
        }

        queue.promote_due(Instant::now());
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("{} pass panicked: {}", options.kind, e);
        }
    }
}
