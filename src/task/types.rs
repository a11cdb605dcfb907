//! 任务与聚合视图
//!
//! Task 为可变记录；TaskAggregate（父任务 + 有序直接子任务）在读取时组装，不落库。

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// 任务 ID
pub type TaskId = String;

/// 任务状态机：WAITING --start--> PROGRESSING --success--> COMPLETED，
/// PROGRESSING --failure--> FAILED；COMPLETED / FAILED 为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Waiting,
    Progressing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub session_id: String,
    pub user_id: String,
    /// 父任务 ID；顶层任务为 None
    pub parent_id: Option<TaskId>,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    /// 进度（0-100）
    pub progress: u8,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            user_id: user_id.into(),
            parent_id: None,
            name: name.into(),
            description: description.into(),
            status: TaskStatus::Waiting,
            progress: 0,
            created_at: Utc::now().timestamp_millis(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 创建 parent 的子任务（继承会话与用户）
    pub fn subtask_of(parent: &Task, name: impl Into<String>, description: impl Into<String>) -> Self {
        let mut task = Self::new(
            parent.session_id.clone(),
            parent.user_id.clone(),
            name,
            description,
        );
        task.parent_id = Some(parent.id.clone());
        task
    }
}

/// 拆分指令中的子任务描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// 聚合视图：父任务 + 创建顺序排列的直接子任务
#[derive(Debug, Clone, Serialize)]
pub struct TaskAggregate {
    pub parent: Task,
    pub subtasks: Vec<Task>,
}

impl TaskAggregate {
    /// 父任务状态的确定性聚合规则（全序，显式固定并测试）：
    /// 失败支配一切；完成要求全部完成；任一子任务离开 WAITING 即 PROGRESSING；
    /// 无子任务时沿用父任务自身状态。
    pub fn derived_status(&self) -> TaskStatus {
        if self.subtasks.is_empty() {
            return self.parent.status;
        }
        if self.subtasks.iter().any(|t| t.status == TaskStatus::Failed) {
            return TaskStatus::Failed;
        }
        if self.subtasks.iter().all(|t| t.status == TaskStatus::Completed) {
            return TaskStatus::Completed;
        }
        if self.subtasks.iter().any(|t| t.status != TaskStatus::Waiting) {
            return TaskStatus::Progressing;
        }
        TaskStatus::Waiting
    }

    /// 父任务进度 = 子任务进度均值（向下取整）
    pub fn derived_progress(&self) -> u8 {
        if self.subtasks.is_empty() {
            return self.parent.progress;
        }
        let sum: u32 = self.subtasks.iter().map(|t| t.progress as u32).sum();
        (sum / self.subtasks.len() as u32) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate_with(statuses: &[TaskStatus]) -> TaskAggregate {
        let parent = Task::new("s1", "u1", "parent", "");
        let subtasks = statuses
            .iter()
            .map(|st| {
                let mut t = Task::subtask_of(&parent, "sub", "");
                t.status = *st;
                if *st == TaskStatus::Completed {
                    t.progress = 100;
                }
                t
            })
            .collect();
        TaskAggregate { parent, subtasks }
    }

    #[test]
    fn all_completed_is_completed() {
        let agg = aggregate_with(&[TaskStatus::Completed, TaskStatus::Completed]);
        assert_eq!(agg.derived_status(), TaskStatus::Completed);
        assert_eq!(agg.derived_progress(), 100);
    }

    #[test]
    fn failure_dominates() {
        let agg = aggregate_with(&[TaskStatus::Completed, TaskStatus::Failed]);
        assert_eq!(agg.derived_status(), TaskStatus::Failed);
        // 失败支配：即使尚有 WAITING 子任务
        let agg = aggregate_with(&[TaskStatus::Waiting, TaskStatus::Failed]);
        assert_eq!(agg.derived_status(), TaskStatus::Failed);
    }

    #[test]
    fn mixed_waiting_progressing_is_progressing() {
        let agg = aggregate_with(&[TaskStatus::Waiting, TaskStatus::Progressing]);
        assert_eq!(agg.derived_status(), TaskStatus::Progressing);
    }

    #[test]
    fn all_waiting_is_waiting() {
        let agg = aggregate_with(&[TaskStatus::Waiting, TaskStatus::Waiting]);
        assert_eq!(agg.derived_status(), TaskStatus::Waiting);
    }

    #[test]
    fn no_subtasks_uses_parent_status() {
        let parent = Task::new("s1", "u1", "parent", "");
        let agg = TaskAggregate {
            parent,
            subtasks: vec![],
        };
        assert_eq!(agg.derived_status(), TaskStatus::Waiting);
    }

    #[test]
    fn progress_is_floor_of_mean() {
        let parent = Task::new("s1", "u1", "parent", "");
        let mut a = Task::subtask_of(&parent, "a", "");
        a.progress = 100;
        let mut b = Task::subtask_of(&parent, "b", "");
        b.progress = 33;
        let agg = TaskAggregate {
            parent,
            subtasks: vec![a, b],
        };
        assert_eq!(agg.derived_progress(), 66);
    }
}
