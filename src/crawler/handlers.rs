use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::crawler::engine::{CrawlEngine, EngineError};
use crate::crawler::task::{TaskOutput, TaskPayload, TaskType};
use crate::source::{AdapterCall, AdapterOutput, SourceAdapter};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{handler} handler was given a {actual} task")]
    WrongPayload { handler: TaskType, actual: TaskType },

    #[error("adapter returned no {0} result")]
    UnexpectedOutput(TaskType),

    #[error("no session snapshot was captured by this task")]
    NoSession,
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("a handler for {0} tasks is already registered")]
    AlreadyRegistered(TaskType),

    #[error("no handler registered for: {0:?}")]
    MissingHandlers(Vec<TaskType>),
}

/// Runs one kind of task through the engine
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn handle(
        &self,
        payload: &TaskPayload,
        adapter: &dyn SourceAdapter,
        engine: &CrawlEngine,
    ) -> Result<TaskOutput, HandlerError>;
}

fn wrong_payload(handler: TaskType, payload: &TaskPayload) -> HandlerError {
    HandlerError::WrongPayload {
        handler,
        actual: payload.task_type(),
    }
}

pub struct BookHandler;

#[async_trait]
impl TaskHandler for BookHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Book
    }

    async fn handle(
        &self,
        payload: &TaskPayload,
        adapter: &dyn SourceAdapter,
        engine: &CrawlEngine,
    ) -> Result<TaskOutput, HandlerError> {
        let TaskPayload::Book(task) = payload else {
            return Err(wrong_payload(self.task_type(), payload));
        };

        match engine.process_page(&task.book_url, adapter, AdapterCall::BookInfo).await? {
            AdapterOutput::Book(book) => {
                info!(url = %task.book_url, "Extracted book '{}' with {} chapters", book.name, book.chapters.len());
                Ok(TaskOutput::Book(book))
            }
            _ => Err(HandlerError::UnexpectedOutput(TaskType::Book)),
        }
    }
}

pub struct ChapterHandler;

#[async_trait]
impl TaskHandler for ChapterHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Chapter
    }

    async fn handle(
        &self,
        payload: &TaskPayload,
        adapter: &dyn SourceAdapter,
        engine: &CrawlEngine,
    ) -> Result<TaskOutput, HandlerError> {
        let TaskPayload::Chapter(task) = payload else {
            return Err(wrong_payload(self.task_type(), payload));
        };

        match engine.process_page(&task.chapter_url, adapter, AdapterCall::Chapter).await? {
            AdapterOutput::Chapter(content) => {
                info!(url = %task.chapter_url, "Extracted chapter {} ({} chars)", content.chapter_id, content.text.len());
                Ok(TaskOutput::Chapter(content))
            }
            _ => Err(HandlerError::UnexpectedOutput(TaskType::Chapter)),
        }
    }
}

/// Refreshes the session in a visible browser, where an operator can answer captchas
pub struct SessionHandler;

#[async_trait]
impl TaskHandler for SessionHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Session
    }

    async fn handle(
        &self,
        payload: &TaskPayload,
        adapter: &dyn SourceAdapter,
        engine: &CrawlEngine,
    ) -> Result<TaskOutput, HandlerError> {
        let TaskPayload::Session(task) = payload else {
            return Err(wrong_payload(self.task_type(), payload));
        };

        let started = Utc::now();
        engine
            .process_page_exclusive(&task.url, adapter, AdapterCall::Session, false)
            .await?;

        // An older snapshot means this run failed to capture one
        let snapshot = engine
            .sessions()
            .load()
            .await
            .map_err(EngineError::from)?
            .filter(|snapshot| snapshot.timestamp >= started)
            .ok_or(HandlerError::NoSession)?;
        Ok(TaskOutput::Session(snapshot.summary()))
    }
}

/// Handlers keyed by task type
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handler for every task type
    pub fn with_defaults() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register(Arc::new(BookHandler))?;
        registry.register(Arc::new(ChapterHandler))?;
        registry.register(Arc::new(SessionHandler))?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), RegistryError> {
        let task_type = handler.task_type();
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        debug!("Registered {} handler", task_type);
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    /// Every task type must have a handler
    pub fn validate(&self) -> Result<(), RegistryError> {
        let missing: Vec<TaskType> = TaskType::ALL
            .iter()
            .copied()
            .filter(|t| !self.handlers.contains_key(t))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::MissingHandlers(missing))
        }
    }
}
