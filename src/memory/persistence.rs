//! 持久化接口
//!
//! 存储与查询由外部协作方实现，这里只定义契约：消息追加/历史加载、
//! 任务创建/更新/聚合读取。附带内存实现，供测试与嵌入方使用。
//! 消息的追加顺序就是会话内的全序，存储实现必须保持。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::memory::Message;
use crate::task::{Task, TaskAggregate, TaskId};

/// 会话消息存储契约
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 追加一条消息；追加顺序即持久化顺序
    async fn append_message(&self, session_id: &str, message: Message) -> Result<(), String>;

    /// 按追加顺序加载全部历史；不存在的会话返回空 Vec
    async fn load_history(&self, session_id: &str) -> Result<Vec<Message>, String>;
}

/// 任务存储契约
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: Task) -> Result<(), String>;

    async fn update_task(&self, task: Task) -> Result<(), String>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, String>;

    /// parent 的直接子任务，按创建顺序
    async fn subtasks(&self, parent_id: &str) -> Result<Vec<Task>, String>;

    /// 会话中最近创建的顶层任务及其子任务；没有则返回 None
    async fn load_task_aggregate(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<TaskAggregate>, String>;
}

/// 内存会话存储（测试 / 嵌入方参考实现）
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn append_message(&self, session_id: &str, message: Message) -> Result<(), String> {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn load_history(&self, session_id: &str) -> Result<Vec<Message>, String> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// 内存任务存储：HashMap + 创建顺序索引
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    /// 创建顺序（子任务顺序与「最近顶层任务」查询都依赖它）
    order: RwLock<Vec<TaskId>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: Task) -> Result<(), String> {
        let id = task.id.clone();
        self.tasks.write().await.insert(id.clone(), task);
        self.order.write().await.push(id);
        Ok(())
    }

    async fn update_task(&self, task: Task) -> Result<(), String> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task.id) {
            return Err(format!("unknown task: {}", task.id));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, String> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn subtasks(&self, parent_id: &str) -> Result<Vec<Task>, String> {
        let tasks = self.tasks.read().await;
        let order = self.order.read().await;
        Ok(order
            .iter()
            .filter_map(|id| tasks.get(id))
            .filter(|t| t.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn load_task_aggregate(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<TaskAggregate>, String> {
        let parent = {
            let tasks = self.tasks.read().await;
            let order = self.order.read().await;
            order
                .iter()
                .rev()
                .filter_map(|id| tasks.get(id))
                .find(|t| {
                    t.parent_id.is_none() && t.session_id == session_id && t.user_id == user_id
                })
                .cloned()
        };
        let parent = match parent {
            Some(p) => p,
            None => return Ok(None),
        };
        let subtasks = self.subtasks(&parent.id).await?;
        Ok(Some(TaskAggregate { parent, subtasks }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_preserves_append_order() {
        let store = InMemorySessionStore::new();
        store.append_message("s1", Message::user("one")).await.unwrap();
        store.append_message("s1", Message::assistant("two")).await.unwrap();
        store.append_message("s1", Message::user("three")).await.unwrap();

        let history = store.load_history("s1").await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);

        assert!(store.load_history("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_root_task_wins() {
        let store = InMemoryTaskStore::new();
        let first = Task::new("s1", "u1", "first", "");
        let second = Task::new("s1", "u1", "second", "");
        store.create_task(first).await.unwrap();
        store.create_task(second.clone()).await.unwrap();

        let agg = store.load_task_aggregate("s1", "u1").await.unwrap().unwrap();
        assert_eq!(agg.parent.id, second.id);
        assert!(agg.subtasks.is_empty());

        assert!(store.load_task_aggregate("s2", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn subtasks_in_creation_order() {
        let store = InMemoryTaskStore::new();
        let parent = Task::new("s1", "u1", "parent", "");
        let a = Task::subtask_of(&parent, "a", "");
        let b = Task::subtask_of(&parent, "b", "");
        store.create_task(parent.clone()).await.unwrap();
        store.create_task(a.clone()).await.unwrap();
        store.create_task(b.clone()).await.unwrap();

        let subs = store.subtasks(&parent.id).await.unwrap();
        let ids: Vec<_> = subs.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);
    }
}
