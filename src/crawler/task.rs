use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::browser::SessionSummary;
use crate::source::{Book, ChapterContent};

/// First segment of every task topic
pub const TOPIC_PREFIX: &str = "crawl";

#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("invalid topic format: {0}")]
    Malformed(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),
}

/// Site a task targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Sangtacviet,
    Wikidich,
    Metruyenchu,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [
        SourceType::Sangtacviet,
        SourceType::Wikidich,
        SourceType::Metruyenchu,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Sangtacviet => "sangtacviet",
            SourceType::Wikidich => "wikidich",
            SourceType::Metruyenchu => "metruyenchu",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceType::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| TopicError::UnknownSource(s.to_string()))
    }
}

/// What a task asks the agent to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Book,
    Chapter,
    Session,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [TaskType::Book, TaskType::Chapter, TaskType::Session];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Book => "book",
            TaskType::Chapter => "chapter",
            TaskType::Session => "session",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TopicError::UnknownTaskType(s.to_string()))
    }
}

/// Routing key for a source and task type: `crawl.<source>.<type>`
pub fn build_topic(source: SourceType, task_type: TaskType) -> String {
    format!("{}.{}.{}", TOPIC_PREFIX, source, task_type)
}

/// Inverse of [`build_topic`]
pub fn parse_topic(topic: &str) -> Result<(SourceType, TaskType), TopicError> {
    let parts: Vec<&str> = topic.split('.').collect();
    if parts.len() != 3 || parts[0] != TOPIC_PREFIX {
        return Err(TopicError::Malformed(topic.to_string()));
    }

    Ok((parts[1].parse()?, parts[2].parse()?))
}

/// A task as it travels over the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// `crawl.<source>.<type>`
    pub topic: String,

    /// Variant-specific JSON, see [`TaskPayload`]
    pub payload: Value,

    /// Site the task targets
    pub source: SourceType,
}

impl Task {
    /// Create a task for `url`
    pub fn new(source: SourceType, task_type: TaskType, url: &str) -> Self {
        let payload = TaskPayload::for_url(task_type, url);
        Self {
            topic: build_topic(source, task_type),
            payload: payload.to_value(),
            source,
        }
    }

    pub fn book(source: SourceType, book_url: &str) -> Self {
        Self::new(source, TaskType::Book, book_url)
    }

    pub fn chapter(source: SourceType, chapter_url: &str) -> Self {
        Self::new(source, TaskType::Chapter, chapter_url)
    }

    pub fn session(source: SourceType, url: &str) -> Self {
        Self::new(source, TaskType::Session, url)
    }

    /// Decode a broker message body
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode the payload as the variant named by `task_type`
    pub fn decode_payload(&self, task_type: TaskType) -> Result<TaskPayload, serde_json::Error> {
        let payload = match task_type {
            TaskType::Book => TaskPayload::Book(serde_json::from_value(self.payload.clone())?),
            TaskType::Chapter => TaskPayload::Chapter(serde_json::from_value(self.payload.clone())?),
            TaskType::Session => TaskPayload::Session(serde_json::from_value(self.payload.clone())?),
        };
        Ok(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookTask {
    pub book_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterTask {
    pub chapter_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTask {
    pub url: String,
}

/// Typed task payload
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    Book(BookTask),
    Chapter(ChapterTask),
    Session(SessionTask),
}

impl TaskPayload {
    pub fn for_url(task_type: TaskType, url: &str) -> Self {
        let url = url.to_string();
        match task_type {
            TaskType::Book => TaskPayload::Book(BookTask { book_url: url }),
            TaskType::Chapter => TaskPayload::Chapter(ChapterTask { chapter_url: url }),
            TaskType::Session => TaskPayload::Session(SessionTask { url }),
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::Book(_) => TaskType::Book,
            TaskPayload::Chapter(_) => TaskType::Chapter,
            TaskPayload::Session(_) => TaskType::Session,
        }
    }

    /// The URL the task is about
    pub fn url(&self) -> &str {
        match self {
            TaskPayload::Book(task) => &task.book_url,
            TaskPayload::Chapter(task) => &task.chapter_url,
            TaskPayload::Session(task) => &task.url,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            TaskPayload::Book(task) => serde_json::json!({ "book_url": task.book_url }),
            TaskPayload::Chapter(task) => serde_json::json!({ "chapter_url": task.chapter_url }),
            TaskPayload::Session(task) => serde_json::json!({ "url": task.url }),
        }
    }
}

/// Result of a successfully handled task
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TaskOutput {
    Book(Book),
    Chapter(ChapterContent),
    Session(SessionSummary),
}

/// Correlation id reported upstream for a task
pub fn task_id(source: SourceType, task_type: TaskType, url: &str) -> String {
    format!("{}-{}-{}-{}", source, task_type, url, Utc::now().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_round_trip() {
        for source in SourceType::ALL {
            for task_type in TaskType::ALL {
                let topic = build_topic(source, task_type);
                assert_eq!(parse_topic(&topic), Ok((source, task_type)));
            }
        }
    }

    #[test]
    fn test_parse_topic_rejects_bad_shapes() {
        assert!(matches!(parse_topic("crawl.sangtacviet"), Err(TopicError::Malformed(_))));
        assert!(matches!(
            parse_topic("crawl.sangtacviet.chapter.extra"),
            Err(TopicError::Malformed(_))
        ));
        assert!(matches!(parse_topic("fetch.sangtacviet.book"), Err(TopicError::Malformed(_))));
        assert_eq!(
            parse_topic("crawl.unknown.book"),
            Err(TopicError::UnknownSource("unknown".to_string()))
        );
        assert_eq!(
            parse_topic("crawl.wikidich.list"),
            Err(TopicError::UnknownTaskType("list".to_string()))
        );
    }

    #[test]
    fn test_wire_format() {
        let task = Task::chapter(SourceType::Sangtacviet, "https://sangtacviet.app/truyen/a/1/2/3/");
        let json: Value = serde_json::from_slice(&task.to_bytes().unwrap()).unwrap();

        assert_eq!(json["topic"], "crawl.sangtacviet.chapter");
        assert_eq!(json["source"], "sangtacviet");
        assert_eq!(json["payload"]["chapter_url"], "https://sangtacviet.app/truyen/a/1/2/3/");
    }

    #[test]
    fn test_decode_payload_matches_type() {
        let body = br#"{"topic":"crawl.sangtacviet.book","payload":{"book_url":"https://x/b/"},"source":"sangtacviet"}"#;
        let task = Task::from_bytes(body).unwrap();

        let payload = task.decode_payload(TaskType::Book).unwrap();
        assert_eq!(payload.task_type(), TaskType::Book);
        assert_eq!(payload.url(), "https://x/b/");

        // A book payload does not carry a chapter_url
        assert!(task.decode_payload(TaskType::Chapter).is_err());
    }

    #[test]
    fn test_unknown_source_is_malformed_message() {
        let body = br#"{"topic":"crawl.nowhere.book","payload":{"book_url":"u"},"source":"nowhere"}"#;
        assert!(Task::from_bytes(body).is_err());
        assert!(Task::from_bytes(b"not-json").is_err());
    }

    #[test]
    fn test_task_id_shape() {
        let id = task_id(SourceType::Sangtacviet, TaskType::Book, "https://x/b/");
        assert!(id.starts_with("sangtacviet-book-https://x/b/-"));
    }
}
