//! 任务生命周期引擎
//!
//! 驱动任务状态机并维护父任务聚合。所有 Task 记录的变更只经过本引擎；
//! 共享同一父任务的子任务变更按父任务 ID 串行化，避免兄弟子任务并发完成时
//! 丢失父聚合更新。非法转移返回 TaskStateError，由调用方记录后继续轮次。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::core::TurnError;
use crate::memory::TaskStore;
use crate::task::{SubtaskDescriptor, Task, TaskAggregate, TaskId, TaskStatus};

/// 任务生命周期引擎
pub struct TaskLifecycleEngine {
    store: Arc<dyn TaskStore>,
    /// 每个父任务一把锁（根任务以自身 ID 计）
    locks: Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TaskLifecycleEngine {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn load(&self, task_id: &str) -> Result<Task, TurnError> {
        self.store
            .get_task(task_id)
            .await
            .map_err(TurnError::Store)?
            .ok_or_else(|| TurnError::TaskState(format!("unknown task: {task_id}")))
    }

    /// 创建顶层任务（WAITING）
    pub async fn create_root(
        &self,
        session_id: &str,
        user_id: &str,
        name: &str,
        description: &str,
    ) -> Result<Task, TurnError> {
        let task = Task::new(session_id, user_id, name, description);
        self.store
            .create_task(task.clone())
            .await
            .map_err(TurnError::Store)?;
        Ok(task)
    }

    /// TASK_SPLIT：在父任务下按给定顺序创建 N 个 WAITING 子任务
    pub async fn split(
        &self,
        parent_id: &str,
        descriptors: &[SubtaskDescriptor],
    ) -> Result<Vec<Task>, TurnError> {
        let parent = self.load(parent_id).await?;
        if parent.status != TaskStatus::Waiting {
            return Err(TurnError::TaskState(format!(
                "cannot split task {} in state {:?}",
                parent_id, parent.status
            )));
        }

        let mut subtasks = Vec::with_capacity(descriptors.len());
        for d in descriptors {
            let sub = Task::subtask_of(&parent, &d.name, &d.description);
            self.store
                .create_task(sub.clone())
                .await
                .map_err(TurnError::Store)?;
            subtasks.push(sub);
        }
        Ok(subtasks)
    }

    /// TASK_SPLIT_FINISH：拆分结束，父任务 WAITING -> PROGRESSING
    pub async fn split_finish(&self, parent_id: &str) -> Result<Task, TurnError> {
        self.start(parent_id).await
    }

    /// TASK_STATUS_TO_LOADING：WAITING -> PROGRESSING
    pub async fn start(&self, task_id: &str) -> Result<Task, TurnError> {
        let guard_key = self.guard_key(task_id).await?;
        let lock = self.lock_for(&guard_key);
        let _guard = lock.lock().await;

        let mut task = self.load(task_id).await?;
        if task.status != TaskStatus::Waiting {
            return Err(TurnError::TaskState(format!(
                "cannot start task {} in state {:?}",
                task_id, task.status
            )));
        }
        task.status = TaskStatus::Progressing;
        task.started_at = Some(Utc::now().timestamp_millis());
        self.store
            .update_task(task.clone())
            .await
            .map_err(TurnError::Store)?;
        self.refresh_parent(&task).await?;
        Ok(task)
    }

    /// 更新进度（仅 PROGRESSING 状态）
    pub async fn update_progress(&self, task_id: &str, progress: u8) -> Result<Task, TurnError> {
        let guard_key = self.guard_key(task_id).await?;
        let lock = self.lock_for(&guard_key);
        let _guard = lock.lock().await;

        let mut task = self.load(task_id).await?;
        if task.status != TaskStatus::Progressing {
            return Err(TurnError::TaskState(format!(
                "cannot update progress of task {} in state {:?}",
                task_id, task.status
            )));
        }
        task.progress = progress.min(100);
        self.store
            .update_task(task.clone())
            .await
            .map_err(TurnError::Store)?;
        self.refresh_parent(&task).await?;
        Ok(task)
    }

    /// TASK_STATUS_TO_FINISH：PROGRESSING -> COMPLETED，进度强制置 100
    pub async fn finish(&self, task_id: &str) -> Result<Task, TurnError> {
        let guard_key = self.guard_key(task_id).await?;
        let lock = self.lock_for(&guard_key);
        let _guard = lock.lock().await;

        let mut task = self.load(task_id).await?;
        if task.status != TaskStatus::Progressing {
            return Err(TurnError::TaskState(format!(
                "cannot finish task {} in state {:?}",
                task_id, task.status
            )));
        }
        task.status = TaskStatus::Completed;
        task.progress = 100;
        task.completed_at = Some(Utc::now().timestamp_millis());
        self.store
            .update_task(task.clone())
            .await
            .map_err(TurnError::Store)?;
        self.refresh_parent(&task).await?;
        Ok(task)
    }

    /// 失败路径：任何非终态均可进入 FAILED（流中断时活动任务可能仍在 WAITING）
    pub async fn fail(&self, task_id: &str) -> Result<Task, TurnError> {
        let guard_key = self.guard_key(task_id).await?;
        let lock = self.lock_for(&guard_key);
        let _guard = lock.lock().await;

        let mut task = self.load(task_id).await?;
        if task.status.is_terminal() {
            return Err(TurnError::TaskState(format!(
                "cannot fail task {} in terminal state {:?}",
                task_id, task.status
            )));
        }
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now().timestamp_millis());
        self.store
            .update_task(task.clone())
            .await
            .map_err(TurnError::Store)?;
        self.refresh_parent(&task).await?;
        Ok(task)
    }

    /// 会话当前任务的聚合视图；无活动任务时返回 None
    pub async fn current_session_task(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<TaskAggregate>, TurnError> {
        self.store
            .load_task_aggregate(session_id, user_id)
            .await
            .map_err(TurnError::Store)
    }

    /// 串行化键：子任务用父 ID，根任务用自身 ID
    async fn guard_key(&self, task_id: &str) -> Result<String, TurnError> {
        let task = self.load(task_id).await?;
        Ok(task.parent_id.unwrap_or(task.id))
    }

    /// 子任务变更后按固定聚合规则回写父任务的状态与进度
    async fn refresh_parent(&self, task: &Task) -> Result<(), TurnError> {
        let parent_id = match &task.parent_id {
            Some(id) => id.clone(),
            None => return Ok(()),
        };
        let mut parent = self.load(&parent_id).await?;
        let subtasks = self
            .store
            .subtasks(&parent_id)
            .await
            .map_err(TurnError::Store)?;
        let aggregate = TaskAggregate {
            parent: parent.clone(),
            subtasks,
        };

        let derived = aggregate.derived_status();
        parent.progress = aggregate.derived_progress();
        if derived != parent.status && !parent.status.is_terminal() {
            parent.status = derived;
            match derived {
                TaskStatus::Progressing => {
                    parent.started_at =
                        parent.started_at.or_else(|| Some(Utc::now().timestamp_millis()));
                }
                TaskStatus::Completed | TaskStatus::Failed => {
                    parent.completed_at = Some(Utc::now().timestamp_millis());
                }
                TaskStatus::Waiting => {}
            }
        }
        self.store
            .update_task(parent)
            .await
            .map_err(TurnError::Store)
    }
}
