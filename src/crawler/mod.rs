pub mod dispatcher;
pub mod engine;
pub mod frontier;
pub mod handlers;
pub mod task;

// Re-export common types
pub use dispatcher::{DispatchLoop, Dispatcher, Disposition, Lane, TaskProcessor, TaskSink};
pub use engine::{CrawlEngine, EngineError, FetchedPage, PageArchive, ResponseCallback};
pub use frontier::{Frontier, QueueItem};
pub use handlers::{HandlerError, HandlerRegistry, RegistryError, TaskHandler};
pub use task::{SourceType, Task, TaskOutput, TaskPayload, TaskType};
