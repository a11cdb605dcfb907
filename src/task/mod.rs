//! 任务层：任务记录、聚合视图与生命周期引擎

pub mod engine;
pub mod types;

pub use engine::TaskLifecycleEngine;
pub use types::{SubtaskDescriptor, Task, TaskAggregate, TaskId, TaskStatus};
