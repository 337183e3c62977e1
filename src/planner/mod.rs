pub mod service;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock;
use crate::domain::plan::{EmsPlanOutput, PlanStatus};

/// Produces one plan per invocation. Failures are reported as a
/// `Not Solved` plan plus a message; the planner never sees an error.
#[async_trait]
pub trait PlanService: Send + Sync {
    async fn generate(&self) -> (EmsPlanOutput, Option<String>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Accepted,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub accepted_at: DateTime<FixedOffset>,
    pub started_at: Option<DateTime<FixedOffset>>,
    pub finished_at: Option<DateTime<FixedOffset>>,
    pub message: Option<String>,
}

impl RunState {
    fn accepted() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            status: RunStatus::Accepted,
            accepted_at: clock::now(),
            started_at: None,
            finished_at: None,
            message: None,
        }
    }
}

/// One published planning result. Immutable; superseded, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedPlan {
    pub run: RunState,
    pub plan: EmsPlanOutput,
}

impl PublishedPlan {
    fn generated_ts(&self) -> f64 {
        self.plan.generated_at.timestamp_micros() as f64 / 1e6
    }
}

#[derive(Default)]
struct Flight {
    running: Option<RunState>,
    queued: bool,
}

struct PlannerInner {
    service: Arc<dyn PlanService>,
    flight: Mutex<Flight>,
    latest_tx: watch::Sender<Option<Arc<PublishedPlan>>>,
    cancel: CancellationToken,
    debounce_window: Duration,
    debounce: Mutex<Option<JoinHandle<()>>>,
}

/// Single-flight plan orchestrator.
///
/// Exactly one solve runs at a time; triggers during a run coalesce into at
/// most one queued rerun. Publications supersede the latest plan and wake
/// all awaiters.
#[derive(Clone)]
pub struct Planner {
    inner: Arc<PlannerInner>,
}

impl Planner {
    pub fn new(service: Arc<dyn PlanService>, debounce_window: Duration) -> Self {
        let (latest_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(PlannerInner {
                service,
                flight: Mutex::new(Flight::default()),
                latest_tx,
                cancel: CancellationToken::new(),
                debounce_window,
                debounce: Mutex::new(None),
            }),
        }
    }

    /// Request a run. Returns the run that will satisfy the request and
    /// whether it was already in flight.
    pub async fn trigger_run(&self) -> (RunState, bool) {
        PlannerInner::trigger_run(&self.inner).await
    }

    /// Latest published plan, if any.
    pub fn latest(&self) -> Option<Arc<PublishedPlan>> {
        self.inner.latest_tx.borrow().clone()
    }

    /// Long-poll for a plan newer than `since_ts` (epoch seconds). Returns
    /// immediately when one is already published; `None` on timeout or
    /// shutdown.
    pub async fn await_latest(
        &self,
        since_ts: f64,
        timeout: Duration,
    ) -> Option<Arc<PublishedPlan>> {
        let mut rx = self.inner.latest_tx.subscribe();
        {
            let current = rx.borrow_and_update();
            if let Some(published) = current.as_ref() {
                if published.generated_ts() > since_ts {
                    return Some(Arc::clone(published));
                }
            }
        }

        let newer = async {
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                let published = {
                    let current = rx.borrow_and_update();
                    current.as_ref().map(Arc::clone)
                };
                if let Some(published) = published {
                    if published.generated_ts() > since_ts {
                        return Some(published);
                    }
                }
            }
        };

        tokio::select! {
            result = newer => result,
            _ = tokio::time::sleep(timeout) => None,
            _ = self.inner.cancel.cancelled() => None,
        }
    }

    /// Debounced external trigger: repeated calls within the coalescing
    /// window collapse into a single run at window end.
    pub async fn schedule_replan(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let mut pending = self.inner.debounce.lock().await;
        if pending.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *pending = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(inner.debounce_window) => {
                    PlannerInner::trigger_run(&inner).await;
                }
                _ = inner.cancel.cancelled() => {}
            }
        }));
    }

    /// Stop accepting work: cancels any pending debounce and wakes all
    /// awaiters with a no-content signal. An in-flight solve is allowed to
    /// complete and publish.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.debounce.lock().await.take() {
            handle.abort();
        }
        info!("planner stopped");
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

impl PlannerInner {
    async fn trigger_run(inner: &Arc<Self>) -> (RunState, bool) {
        let mut flight = inner.flight.lock().await;
        if let Some(run) = flight.running.clone() {
            flight.queued = true;
            return (run, true);
        }
        let run = RunState::accepted();
        flight.running = Some(run.clone());
        drop(flight);

        Self::spawn_execute(inner, run.clone());
        (run, false)
    }

    fn spawn_execute(inner: &Arc<Self>, run: RunState) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            Self::execute(inner, run).await;
        });
    }

    async fn execute(inner: Arc<Self>, mut run: RunState) {
        run.status = RunStatus::Running;
        run.started_at = Some(clock::now());
        {
            let mut flight = inner.flight.lock().await;
            flight.running = Some(run.clone());
        }

        let (plan, message) = inner.service.generate().await;
        run.finished_at = Some(clock::now());
        run.status = match plan.status {
            PlanStatus::NotSolved | PlanStatus::Unknown => RunStatus::Failed,
            _ => RunStatus::Completed,
        };
        run.message = message;
        if run.status == RunStatus::Failed {
            warn!(run_id = %run.run_id, message = run.message.as_deref().unwrap_or(""), "plan run failed");
        } else {
            info!(run_id = %run.run_id, status = %plan.status, "plan run published");
        }

        inner
            .latest_tx
            .send_replace(Some(Arc::new(PublishedPlan { run: run.clone(), plan })));

        let mut flight = inner.flight.lock().await;
        if flight.queued && !inner.cancel.is_cancelled() {
            flight.queued = false;
            let next = RunState::accepted();
            flight.running = Some(next.clone());
            drop(flight);
            Self::spawn_execute(&inner, next);
        } else {
            flight.queued = false;
            flight.running = None;
        }
    }
}
