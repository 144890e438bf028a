use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::DispatcherSettings;
use crate::control::{ControlPlane, TaskResult};
use crate::crawler::engine::CrawlEngine;
use crate::crawler::handlers::HandlerRegistry;
use crate::crawler::task::{parse_topic, task_id, Task};
use crate::source::AdapterRegistry;

/// Where a submitted task went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Priority,
    Normal,
    /// The lane was full and the task already ran on the caller
    Inline,
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Bad topic, no adapter or no handler
    Unroutable(String),
    /// Payload does not match the task type
    Malformed(String),
    /// Agent is not active
    Skipped,
    Succeeded,
    Failed(String),
}

/// Accepts tasks from the transport
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Hand `task` off. Once this returns the task is owned by the sink.
    async fn submit(&self, task: Task) -> Lane;
}

/// Resolves a task to its adapter and handler, runs it and reports the outcome
pub struct TaskProcessor {
    adapters: AdapterRegistry,
    handlers: HandlerRegistry,
    engine: Arc<CrawlEngine>,
    control: Arc<dyn ControlPlane>,
    agent_id: Uuid,
    report_results: bool,
}

impl TaskProcessor {
    pub fn new(
        adapters: AdapterRegistry,
        handlers: HandlerRegistry,
        engine: Arc<CrawlEngine>,
        control: Arc<dyn ControlPlane>,
        agent_id: Uuid,
        report_results: bool,
    ) -> Self {
        Self {
            adapters,
            handlers,
            engine,
            control,
            agent_id,
            report_results,
        }
    }

    pub async fn process(&self, task: Task) -> Disposition {
        let (source, task_type) = match parse_topic(&task.topic) {
            Ok(route) => route,
            Err(e) => {
                warn!(topic = %task.topic, "Dropping task: {}", e);
                return Disposition::Unroutable(e.to_string());
            }
        };

        let Some(adapter) = self.adapters.get(source) else {
            warn!(topic = %task.topic, "Dropping task: no adapter for source {}", source);
            return Disposition::Unroutable(format!("no adapter for source {}", source));
        };

        let Some(handler) = self.handlers.get(task_type) else {
            warn!(topic = %task.topic, "Dropping task: no handler for {} tasks", task_type);
            return Disposition::Unroutable(format!("no handler for {} tasks", task_type));
        };

        // The control plane republishes tasks it gave to an inactive agent
        match self.control.is_agent_active(self.agent_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(topic = %task.topic, "Agent is inactive, skipping task");
                return Disposition::Skipped;
            }
            Err(e) => {
                warn!(topic = %task.topic, "Liveness check failed, skipping task: {}", e);
                return Disposition::Skipped;
            }
        }

        let payload = match task.decode_payload(task_type) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %task.topic, "Dropping task with malformed payload: {}", e);
                return Disposition::Malformed(e.to_string());
            }
        };

        let url = payload.url().to_string();
        let task_id = task_id(source, task_type, &url);
        info!(task_id = %task_id, topic = %task.topic, url = %url, "Processing task");

        let result = handler.handle(&payload, adapter.as_ref(), &self.engine).await;
        self.engine.stats().record_task(task_type.as_str(), result.is_ok()).await;

        let (report, disposition) = match result {
            Ok(output) => {
                info!(task_id = %task_id, "Task succeeded");
                let data = match serde_json::to_value(&output) {
                    Ok(data) => Some(data),
                    Err(e) => {
                        warn!(task_id = %task_id, "Could not serialize task output: {}", e);
                        None
                    }
                };
                (
                    TaskResult::success(&task_id, task_type, source, &url, data),
                    Disposition::Succeeded,
                )
            }
            Err(e) => {
                error!(task_id = %task_id, "Task failed: {}", e);
                let message = e.to_string();
                (
                    TaskResult::error(&task_id, task_type, source, &url, &message),
                    Disposition::Failed(message),
                )
            }
        };

        if self.report_results {
            if let Err(e) = self.control.report(&report).await {
                warn!(task_id = %task_id, "Could not report task result: {}", e);
            }
        }

        disposition
    }
}

/// Producer side of the two task lanes
#[derive(Clone)]
pub struct Dispatcher {
    processor: Arc<TaskProcessor>,
    priority_topic: String,
    priority_tx: mpsc::Sender<Task>,
    normal_tx: mpsc::Sender<Task>,
}

/// Consumer side: the single loop that arbitrates between the lanes
pub struct DispatchLoop {
    processor: Arc<TaskProcessor>,
    priority_rx: mpsc::Receiver<Task>,
    normal_rx: mpsc::Receiver<Task>,
    idle: Duration,
    cooldown: Duration,
}

impl Dispatcher {
    pub fn new(
        processor: Arc<TaskProcessor>,
        settings: &DispatcherSettings,
        priority_topic: &str,
    ) -> (Self, DispatchLoop) {
        let (priority_tx, priority_rx) = mpsc::channel(settings.priority_capacity);
        let (normal_tx, normal_rx) = mpsc::channel(settings.normal_capacity);

        let dispatcher = Self {
            processor: Arc::clone(&processor),
            priority_topic: priority_topic.to_string(),
            priority_tx,
            normal_tx,
        };
        let dispatch_loop = DispatchLoop {
            processor,
            priority_rx,
            normal_rx,
            idle: Duration::from_millis(settings.idle_ms),
            cooldown: Duration::from_millis(settings.task_cooldown_ms),
        };

        (dispatcher, dispatch_loop)
    }
}

#[async_trait]
impl TaskSink for Dispatcher {
    async fn submit(&self, task: Task) -> Lane {
        let (sender, lane) = if task.topic == self.priority_topic {
            (&self.priority_tx, Lane::Priority)
        } else {
            (&self.normal_tx, Lane::Normal)
        };

        match sender.try_send(task) {
            Ok(()) => {
                debug!("Task queued on {:?} lane", lane);
                lane
            }
            Err(TrySendError::Full(task)) | Err(TrySendError::Closed(task)) => {
                warn!(topic = %task.topic, "{:?} lane unavailable, processing inline", lane);
                self.processor.process(task).await;
                Lane::Inline
            }
        }
    }
}

impl DispatchLoop {
    /// Next task, priority lane first. `None` when both lanes stayed empty.
    async fn next(&mut self) -> Option<Task> {
        if let Ok(task) = self.priority_rx.try_recv() {
            return Some(task);
        }

        tokio::select! {
            biased;
            Some(task) = self.priority_rx.recv() => Some(task),
            Some(task) = self.normal_rx.recv() => Some(task),
            _ = tokio::time::sleep(self.idle) => None,
        }
    }

    /// Process tasks until shutdown, then finish whatever is already queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Dispatch loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                next = self.next() => next,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if let Some(task) = next {
                self.processor.process(task).await;
                if !self.cooldown.is_zero() {
                    tokio::time::sleep(self.cooldown).await;
                }
            }
        }

        // Tasks already handed to a lane were acknowledged on the broker
        let mut drained = 0;
        while let Ok(task) = self.priority_rx.try_recv() {
            self.processor.process(task).await;
            drained += 1;
        }
        while let Ok(task) = self.normal_rx.try_recv() {
            self.processor.process(task).await;
            drained += 1;
        }

        info!("Dispatch loop stopped ({} queued tasks finished on shutdown)", drained);
    }
}
