//! 轮次端到端集成测试

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use hive::llm::{LlmClient, MockLlmClient, StreamChunk};
use hive::memory::{
    InMemorySessionStore, InMemoryTaskStore, MessageKind, OverflowStrategy, Role, SessionStore,
    TaskStore,
};
use hive::task::TaskStatus;
use hive::tools::{ToolDefinition, ToolEndpoint};
use hive::turn::{TurnContext, TurnEvent, TurnHandle, TurnMode, TurnOrchestrator};

const ANALYZER_ACTIONABLE: &str =
    r#"{"is_question": false, "reply": "", "info_complete": true, "missing_info_prompt": ""}"#;

/// 固定目录的测试端点：调用时回显工具名
struct EchoEndpoint;

#[async_trait]
impl ToolEndpoint for EchoEndpoint {
    fn url(&self) -> &str {
        "test://echo"
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, String> {
        Ok(vec![ToolDefinition {
            name: "weather".to_string(),
            description: "look up the weather".to_string(),
            parameters: json!({"type": "object"}),
        }])
    }

    async fn call(&self, name: &str, arguments: Value) -> Result<String, String> {
        Ok(format!("{name}({arguments}) -> sunny"))
    }
}

async fn collect(handle: &mut TurnHandle) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Some(ev) = handle.next_event().await {
        let terminal = ev.is_terminal();
        events.push(ev);
        if terminal {
            break;
        }
    }
    events
}

#[tokio::test]
async fn full_agent_turn_with_tool_round_trip() {
    let llm = Arc::new(MockLlmClient::new());
    let sessions = Arc::new(InMemorySessionStore::new());
    let tasks = Arc::new(InMemoryTaskStore::new());

    // 脚本：Analyzer 放行 -> 拆成两步 -> 第一步先调工具再作答 -> 第二步直接作答
    llm.push_completion(ANALYZER_ACTIONABLE);
    llm.push_completion(
        r#"[{"name": "check", "description": "check the weather"},
            {"name": "advise", "description": "suggest what to wear"}]"#,
    );
    llm.push_stream(vec![Ok(StreamChunk::tool_call(
        "weather",
        json!({"city": "Berlin"}),
    ))]);
    llm.push_text_stream("It is sunny in Berlin.");
    llm.push_text_stream("A light jacket will do.");

    let orchestrator = Arc::new(TurnOrchestrator::new(
        llm.clone() as Arc<dyn LlmClient>,
        sessions.clone() as Arc<dyn SessionStore>,
        tasks as Arc<dyn TaskStore>,
    ));

    let ctx = TurnContext {
        session_id: "sess-weather".to_string(),
        user_id: "user-1".to_string(),
        budget_tokens: 8000,
        strategy: OverflowStrategy::SlidingWindow,
        mode: TurnMode::Agent,
    };
    let mut handle = orchestrator.clone().submit(
        ctx,
        "Check the weather in Berlin and tell me what to wear".to_string(),
        vec![Arc::new(EchoEndpoint) as Arc<dyn ToolEndpoint>],
    );
    let events = collect(&mut handle).await;

    // 事件全序：EXEC -> SPLIT×2 -> SPLIT_FINISH -> LOADING -> TOOL_CALL ->
    // 文本 -> FINISH -> LOADING -> 文本 -> FINISH -> Completed
    let kinds: Vec<String> = events
        .iter()
        .map(|e| match e {
            TurnEvent::Delta { kind, .. } => format!("{kind:?}"),
            TurnEvent::Completed => "Completed".to_string(),
            TurnEvent::Error { .. } => "Error".to_string(),
        })
        .collect();

    assert_eq!(kinds[0], "TaskExec");
    assert_eq!(&kinds[1..3], ["TaskSplit", "TaskSplit"]);
    assert_eq!(kinds[3], "TaskSplitFinish");
    assert_eq!(kinds[4], "TaskStatusToLoading");
    assert_eq!(kinds[5], "ToolCall");
    assert_eq!(kinds.last().unwrap(), "Completed");
    assert_eq!(kinds.iter().filter(|k| *k == "TaskStatusToFinish").count(), 2);
    // 工具结果先于消费它的助手文本（TOOL_CALL 之后才有 TEXT）
    let tool_pos = kinds.iter().position(|k| k == "ToolCall").unwrap();
    let first_text = kinds.iter().position(|k| k == "Text").unwrap();
    assert!(tool_pos < first_text);

    // 聚合视图：父任务完成、两个子任务按给定顺序完成、进度 100
    let aggregate = orchestrator
        .task_engine()
        .current_session_task("sess-weather", "user-1")
        .await
        .unwrap()
        .expect("aggregate exists");
    assert_eq!(aggregate.parent.status, TaskStatus::Completed);
    assert_eq!(aggregate.parent.progress, 100);
    let names: Vec<_> = aggregate.subtasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["check", "advise"]);
    assert!(aggregate
        .subtasks
        .iter()
        .all(|t| t.status == TaskStatus::Completed && t.progress == 100));

    // 持久化顺序与投递顺序一致：用户消息、任务指令、工具调用、观察与最终文本依次落库
    let history = sessions.load_history("sess-weather").await.unwrap();
    assert_eq!(history[0].kind, MessageKind::Text);
    assert_eq!(history[1].kind, MessageKind::TaskExec);
    assert_eq!(history[2].kind, MessageKind::TaskSplit);
    assert_eq!(history[3].kind, MessageKind::TaskSplit);
    assert_eq!(history[4].kind, MessageKind::TaskSplitFinish);
    assert!(history
        .iter()
        .any(|m| m.kind == MessageKind::ToolCall && m.content.contains("weather")));
    assert!(history
        .iter()
        .any(|m| m.content.contains("Observation from weather") && m.content.contains("sunny")));
    let final_text = history
        .iter()
        .rev()
        .find(|m| m.kind == MessageKind::Text && m.role == Role::Assistant)
        .expect("final assistant text persisted");
    assert_eq!(final_text.content, "A light jacket will do.");
}

#[tokio::test]
async fn chat_turn_streams_and_persists() {
    let llm = Arc::new(MockLlmClient::new());
    let sessions = Arc::new(InMemorySessionStore::new());
    let tasks = Arc::new(InMemoryTaskStore::new());
    llm.push_text_stream("Hello from the engine.");

    let orchestrator = Arc::new(TurnOrchestrator::new(
        llm as Arc<dyn LlmClient>,
        sessions.clone() as Arc<dyn SessionStore>,
        tasks as Arc<dyn TaskStore>,
    ));

    let ctx = TurnContext {
        session_id: "sess-chat".to_string(),
        user_id: "user-1".to_string(),
        budget_tokens: 8000,
        strategy: OverflowStrategy::SlidingWindow,
        mode: TurnMode::Chat,
    };
    let mut handle = orchestrator.clone().submit(ctx, "hello".to_string(), vec![]);
    let events = collect(&mut handle).await;

    assert!(matches!(events.last(), Some(TurnEvent::Completed)));
    let text: String = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Delta {
                kind: MessageKind::Text,
                payload,
                ..
            } => Some(payload.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello from the engine.");

    let history = sessions.load_history("sess-chat").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "Hello from the engine.");

    // Chat 模式不创建任务
    assert!(orchestrator
        .task_engine()
        .current_session_task("sess-chat", "user-1")
        .await
        .unwrap()
        .is_none());
}
