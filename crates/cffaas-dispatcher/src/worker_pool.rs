//! On-demand worker scheduler with a bounded task-creation rate.
//!
//! Work items are handed off one-to-one: a polling worker parks itself as a
//! waiter, a submitter hands its item to exactly one waiter. When no worker
//! shows up promptly the pool asks the platform for another one, but never
//! more than [`MAX_TASKS_PER_WINDOW`] times per rolling window - a slow
//! worker must not turn into a task storm.
//!
//! Task-creation requests are deliberately detached from the submitting
//! request's deadline: once the decision to scale is made it must complete
//! even if the originating caller gives up.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};

use cffaas_common::event::Work;
use cffaas_common::http::{json_response, status_response, EventRequest, EventResponse};
use cffaas_common::platform::TaskCreator;

use crate::handler::Handler;

/// Maximum task creations per budget window.
const MAX_TASKS_PER_WINDOW: u32 = 5;

/// The budget counter resets to zero this often.
const BUDGET_WINDOW: Duration = Duration::from_secs(30);

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long a submitted item may sit undelivered before the pool asks
    /// the platform for another worker.
    pub stall_after: Duration,
    /// How long a polling GET blocks waiting for work.
    pub get_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            stall_after: Duration::from_secs(1),
            get_wait: Duration::from_secs(30),
        }
    }
}

/// Hands parked work URLs to polling workers; provokes task creation under
/// pressure.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    waiters: Mutex<VecDeque<oneshot::Sender<Work>>>,
    waiter_ready: Notify,
    config: PoolConfig,
    task_command: String,
    task_creator: Arc<dyn TaskCreator>,
    task_budget: Mutex<u32>,
    resubmit_tx: mpsc::UnboundedSender<Work>,
}

impl WorkerPool {
    /// Creates a pool and starts its background budget-reset and
    /// resubmission loops.
    ///
    /// # Arguments
    /// * `config` - Timing knobs (see [`PoolConfig`])
    /// * `task_command` - Start command passed to the platform when the pool
    ///   launches another worker
    /// * `task_creator` - The platform seam that actually launches tasks
    pub fn new(
        config: PoolConfig,
        task_command: String,
        task_creator: Arc<dyn TaskCreator>,
    ) -> Self {
        let (resubmit_tx, mut resubmit_rx) = mpsc::unbounded_channel::<Work>();

        let inner = Arc::new(PoolInner {
            waiters: Mutex::new(VecDeque::new()),
            waiter_ready: Notify::new(),
            config,
            task_command,
            task_creator,
            task_budget: Mutex::new(0),
            resubmit_tx,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BUDGET_WINDOW);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                *inner.task_budget.lock() = 0;
            }
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(work) = resubmit_rx.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                tracing::debug!(href = %work.href, "resubmitting undelivered work");
                inner.submit(work).await;
            }
        });

        Self { inner }
    }

    /// Places `work` for pickup and blocks until a worker consumes it.
    ///
    /// Every `stall_after` without a taker the pool tries to launch another
    /// worker (budget permitting) and keeps waiting. Cancellation is by
    /// dropping the returned future; the enclosing request deadline does
    /// that.
    pub async fn submit_work(&self, work: Work) {
        self.inner.submit(work).await;
    }

    /// Current number of parked pollers, for observability.
    pub fn waiting_workers(&self) -> usize {
        self.inner.waiters.lock().len()
    }

    async fn poll_for_work(&self) -> Option<Work> {
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().push_back(tx);
        self.inner.waiter_ready.notify_one();

        let mut guard = WaiterGuard {
            rx,
            resubmit_tx: self.inner.resubmit_tx.clone(),
            received: false,
        };

        match tokio::time::timeout(self.inner.config.get_wait, &mut guard.rx).await {
            Ok(Ok(work)) => {
                guard.received = true;
                Some(work)
            }
            _ => None,
        }
    }
}

impl PoolInner {
    async fn submit(&self, mut work: Work) {
        loop {
            loop {
                let waiter = self.waiters.lock().pop_front();
                match waiter {
                    Some(tx) => match tx.send(work) {
                        Ok(()) => return,
                        // That poller gave up; take the item back and try
                        // the next one.
                        Err(returned) => work = returned,
                    },
                    None => break,
                }
            }

            tokio::select! {
                _ = self.waiter_ready.notified() => {}
                _ = tokio::time::sleep(self.config.stall_after) => {
                    if self.try_add_to_threshold() {
                        let creator = self.task_creator.clone();
                        let command = self.task_command.clone();
                        // Detached: must outlive the originating request.
                        tokio::spawn(async move {
                            if let Err(e) = creator.create_task(&command).await {
                                tracing::warn!(error = %e, "failed to create worker task");
                            }
                        });
                    }
                }
            }
        }
    }

    fn try_add_to_threshold(&self) -> bool {
        let mut budget = self.task_budget.lock();
        if *budget < MAX_TASKS_PER_WINDOW {
            *budget += 1;
            return true;
        }
        false
    }
}

#[async_trait]
impl Handler for WorkerPool {
    async fn handle(&self, req: EventRequest) -> EventResponse {
        if req.method() != Method::GET {
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        match self.poll_for_work().await {
            Some(work) => json_response(StatusCode::OK, &work),
            None => status_response(StatusCode::NO_CONTENT),
        }
    }
}

/// Returns a received-but-unserved item to the pool when the poller's
/// request future is dropped mid-delivery.
struct WaiterGuard {
    rx: oneshot::Receiver<Work>,
    resubmit_tx: mpsc::UnboundedSender<Work>,
    received: bool,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.received {
            return;
        }
        if let Ok(work) = self.rx.try_recv() {
            let _ = self.resubmit_tx.send(work);
        }
    }
}
