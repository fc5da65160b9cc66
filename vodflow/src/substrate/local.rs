//! In-process task substrate.
//!
//! Runs each submitted chain on a spawned tokio task, dispatching stages to
//! registered handlers strictly in order. Delivery is at-least-once from the
//! caller's point of view; handlers must be idempotent.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::stages::{StageContext, StageHandler};
use crate::{Error, Result};

use super::{QueueName, QueueStat, StageTask, TaskChain, TaskState, TaskSubstrate};

#[derive(Default)]
struct QueueCounters {
    active: AtomicUsize,
    reserved: AtomicUsize,
}

struct ChainEntry {
    state: TaskState,
    token: CancellationToken,
}

struct Inner {
    handlers: RwLock<HashMap<crate::jobs::plan::JobStage, Arc<dyn StageHandler>>>,
    chains: DashMap<String, ChainEntry>,
    counters: HashMap<QueueName, QueueCounters>,
}

impl Inner {
    fn counters(&self, queue: QueueName) -> &QueueCounters {
        // The map is built from QueueName::ALL and never mutated.
        self.counters.get(&queue).expect("all queues present")
    }

    /// Update a chain's state; terminal states are never overwritten.
    fn transition(&self, task_id: &str, state: TaskState) {
        if let Some(mut entry) = self.chains.get_mut(task_id) {
            if entry.state.is_terminal() {
                return;
            }
            entry.state = state;
        }
    }
}

/// Tokio-backed implementation of [`TaskSubstrate`].
pub struct LocalSubstrate {
    inner: Arc<Inner>,
}

impl LocalSubstrate {
    pub fn new() -> Self {
        let counters = QueueName::ALL
            .into_iter()
            .map(|q| (q, QueueCounters::default()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(HashMap::new()),
                chains: DashMap::new(),
                counters,
            }),
        }
    }

    /// Register the handler for its stage, replacing any previous one.
    pub fn register_handler(&self, handler: Arc<dyn StageHandler>) {
        let stage = handler.stage();
        self.inner.handlers.write().insert(stage, handler);
        debug!(%stage, "Registered stage handler");
    }

    async fn run_chain(inner: Arc<Inner>, task_id: String, chain: TaskChain) {
        inner.transition(&task_id, TaskState::Running);

        let token = match inner.chains.get(&task_id) {
            Some(entry) => entry.token.clone(),
            None => return,
        };
        let mut ctx = StageContext::new(token.clone());

        let mut outcome = TaskState::Succeeded;
        let mut remaining = chain.tasks.iter();

        for task in remaining.by_ref() {
            inner.counters(task.queue).reserved.fetch_sub(1, Ordering::Relaxed);

            if token.is_cancelled() {
                outcome = TaskState::Revoked;
                break;
            }

            let handler = inner.handlers.read().get(&task.stage).cloned();
            let Some(handler) = handler else {
                error!(job_id = %task.job_id, stage = %task.stage, "No handler registered for stage");
                outcome = TaskState::Failed {
                    error: format!("no handler registered for stage {}", task.stage),
                };
                break;
            };

            info!(job_id = %task.job_id, stage = %task.stage, queue = %task.queue, "Stage started");
            inner.counters(task.queue).active.fetch_add(1, Ordering::Relaxed);
            let result = handler.run(task, ctx).await;
            inner.counters(task.queue).active.fetch_sub(1, Ordering::Relaxed);

            match result {
                Ok(next_ctx) => {
                    debug!(job_id = %task.job_id, stage = %task.stage, "Stage finished");
                    ctx = next_ctx;
                }
                Err(err) => {
                    warn!(job_id = %task.job_id, stage = %task.stage, error = %err, "Stage failed");
                    outcome = if matches!(err, Error::Download(fetch::DownloadError::Cancelled)) {
                        TaskState::Revoked
                    } else {
                        TaskState::Failed {
                            error: err.to_string(),
                        }
                    };
                    break;
                }
            }
        }

        // Stages after a failure never run; release their reservations.
        for task in remaining {
            inner.counters(task.queue).reserved.fetch_sub(1, Ordering::Relaxed);
        }

        inner.transition(&task_id, outcome);
    }
}

impl Default for LocalSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskSubstrate for LocalSubstrate {
    async fn submit_chain(&self, chain: TaskChain) -> Result<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();

        for task in &chain.tasks {
            self.inner
                .counters(task.queue)
                .reserved
                .fetch_add(1, Ordering::Relaxed);
        }

        self.inner.chains.insert(
            task_id.clone(),
            ChainEntry {
                state: TaskState::Pending,
                token,
            },
        );

        let inner = self.inner.clone();
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            Self::run_chain(inner, spawned_id, chain).await;
        });

        Ok(task_id)
    }

    async fn terminate(&self, task_id: &str) -> Result<()> {
        let entry = self
            .inner
            .chains
            .get(task_id)
            .ok_or_else(|| Error::not_found("Task", task_id))?;
        entry.token.cancel();
        drop(entry);

        self.inner.transition(task_id, TaskState::Revoked);
        info!(task_id, "Terminated task chain");
        Ok(())
    }

    async fn task_state(&self, task_id: &str) -> Result<TaskState> {
        self.inner
            .chains
            .get(task_id)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| Error::not_found("Task", task_id))
    }

    async fn queue_snapshot(&self) -> Result<Vec<QueueStat>> {
        Ok(QueueName::ALL
            .into_iter()
            .map(|queue| {
                let counters = self.inner.counters(queue);
                QueueStat {
                    queue,
                    active_tasks: counters.active.load(Ordering::Relaxed),
                    reserved_tasks: counters.reserved.load(Ordering::Relaxed),
                    weight: queue.weight(),
                }
            })
            .collect())
    }
}
