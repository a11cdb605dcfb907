//! 轮次编排器：主控流程
//!
//! 一次轮次：持久化用户消息 -> Analyzer 门（Agent 模式）-> 上下文窗口 ->
//! 模型流 -> 逐块分类（文本转发 / 工具调用分发 / 任务指令转移）->
//! 持久化结果消息 -> 投递通道收尾。事件全序由本模块单点产生；
//! 同一模型轮次触发的多个工具调用并发执行。流中断时以错误事件截断，
//! 活动任务标记 FAILED，已发出的部分文本不回收。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::analyzer::{Analyzer, AnalyzerVerdict};
use crate::core::TurnError;
use crate::llm::{LlmClient, ToolCallRequest, ToolSpec};
use crate::memory::{
    ContextWindowManager, Message, MessageKind, OverflowStrategy, SessionStore, SummarizeConfig,
    TaskStore,
};
use crate::task::{SubtaskDescriptor, Task, TaskLifecycleEngine};
use crate::tools::{ToolDispatcher, ToolEndpoint};
use crate::turn::{TurnContext, TurnEvent, TurnMode};

/// 单个子任务内模型与工具往返的上限，防止死循环
const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable AI agent. Use the provided tools when \
they help, and answer directly when they do not.";

const SPLIT_PROMPT: &str = r#"You are a task planner. Decompose the user's request into an
ordered list of 1 to 8 concrete steps. Output ONLY a JSON array, no explanation:
[{"name": "<short step name>", "description": "<what to do>"}]"#;

/// 一次轮次的句柄：事件接收端 + 取消令牌。
/// 丢弃句柄（调用方断开）会取消在途的模型流与工具调用。
pub struct TurnHandle {
    events: mpsc::UnboundedReceiver<TurnEvent>,
    cancel: CancellationToken,
}

impl TurnHandle {
    /// 接收下一个事件；通道关闭返回 None
    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    /// 主动取消本轮次
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for TurnHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 轮次编排器
pub struct TurnOrchestrator {
    llm: Arc<dyn LlmClient>,
    sessions: Arc<dyn SessionStore>,
    tasks: Arc<TaskLifecycleEngine>,
    window: ContextWindowManager,
    analyzer: Analyzer,
    system_prompt: String,
    invoke_timeout_secs: u64,
    max_tool_rounds: usize,
    /// 有在途轮次的会话；同会话并发轮次直接拒绝
    active_sessions: Mutex<HashSet<String>>,
}

impl TurnOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        sessions: Arc<dyn SessionStore>,
        task_store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            window: ContextWindowManager::new()
                .with_summarizer(Arc::clone(&llm), SummarizeConfig::default()),
            analyzer: Analyzer::new(Arc::clone(&llm)),
            tasks: Arc::new(TaskLifecycleEngine::new(task_store)),
            llm,
            sessions,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            invoke_timeout_secs: 30,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            active_sessions: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_summarize_config(mut self, cfg: SummarizeConfig) -> Self {
        self.window =
            ContextWindowManager::new().with_summarizer(Arc::clone(&self.llm), cfg);
        self
    }

    pub fn with_invoke_timeout_secs(mut self, secs: u64) -> Self {
        self.invoke_timeout_secs = secs;
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    /// 任务引擎（聚合查询等只读访问）
    pub fn task_engine(&self) -> &TaskLifecycleEngine {
        &self.tasks
    }

    /// 提交一次轮次。端点列表按轮注入（来自工具管理协作方的配置），
    /// 返回句柄供消费事件与取消。
    pub fn submit(
        self: Arc<Self>,
        ctx: TurnContext,
        utterance: String,
        endpoints: Vec<Arc<dyn ToolEndpoint>>,
    ) -> TurnHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = TurnHandle {
            events: rx,
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            self.run_turn(ctx, utterance, endpoints, tx, cancel).await;
        });
        handle
    }

    async fn run_turn(
        &self,
        ctx: TurnContext,
        utterance: String,
        endpoints: Vec<Arc<dyn ToolEndpoint>>,
        tx: mpsc::UnboundedSender<TurnEvent>,
        cancel: CancellationToken,
    ) {
        if !self.begin_session(&ctx.session_id) {
            let err = TurnError::ConcurrentTurn(ctx.session_id.clone());
            tracing::warn!("{err}");
            let _ = tx.send(TurnEvent::Error {
                text: err.to_string(),
            });
            return;
        }

        let mut active_task: Option<String> = None;
        let result = self
            .drive(&ctx, &utterance, endpoints, &tx, &cancel, &mut active_task)
            .await;

        match result {
            Ok(()) => {
                let _ = tx.send(TurnEvent::Completed);
            }
            Err(e) => {
                // 流中断：活动任务标记 FAILED；父任务可能已因子任务失败进入终态，
                // 此时 TaskStateError 只记录不再传播
                if let Some(task_id) = &active_task {
                    if let Err(fail_err) = self.tasks.fail(task_id).await {
                        tracing::warn!("Marking task {} failed: {}", task_id, fail_err);
                    }
                }
                tracing::error!("Turn aborted: {e}");
                let _ = tx.send(TurnEvent::Error {
                    text: e.to_string(),
                });
            }
        }
        self.end_session(&ctx.session_id);
    }

    async fn drive(
        &self,
        ctx: &TurnContext,
        utterance: &str,
        endpoints: Vec<Arc<dyn ToolEndpoint>>,
        tx: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
        active_task: &mut Option<String>,
    ) -> Result<(), TurnError> {
        self.sessions
            .append_message(&ctx.session_id, Message::user(utterance))
            .await
            .map_err(TurnError::Store)?;

        // NONE 策略下先做预算预检：溢出必须在任何模型调用之前上抛
        if ctx.strategy == OverflowStrategy::None {
            let history = self.load_model_history(&ctx.session_id).await?;
            self.window
                .build(
                    &history,
                    &Message::system(&self.system_prompt),
                    ctx.budget_tokens,
                    OverflowStrategy::None,
                )
                .await?;
        }

        match ctx.mode {
            TurnMode::Chat => self.chat_turn(ctx, tx, cancel).await,
            TurnMode::Agent => {
                self.agent_turn(ctx, utterance, endpoints, tx, cancel, active_task)
                    .await
            }
        }
    }

    /// Chat 模式：窗口 -> 模型流 -> 文本事件 -> 持久化
    async fn chat_turn(
        &self,
        ctx: &TurnContext,
        tx: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), TurnError> {
        let history = self.load_model_history(&ctx.session_id).await?;
        let window = self
            .window
            .build(
                &history,
                &Message::system(&self.system_prompt),
                ctx.budget_tokens,
                ctx.strategy,
            )
            .await?;
        let (text, _calls) = self.stream_model(window.messages(), &[], tx, cancel).await?;
        self.persist_assistant_text(ctx, &text).await?;
        Ok(())
    }

    /// Agent 模式：Analyzer 门 -> 任务创建 -> 拆分 -> 依序执行子任务
    async fn agent_turn(
        &self,
        ctx: &TurnContext,
        utterance: &str,
        endpoints: Vec<Arc<dyn ToolEndpoint>>,
        tx: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
        active_task: &mut Option<String>,
    ) -> Result<(), TurnError> {
        let history = self
            .sessions
            .load_history(&ctx.session_id)
            .await
            .map_err(TurnError::Store)?;

        match self.analyzer.analyze(utterance, &history).await {
            AnalyzerVerdict::Question { reply } => {
                return self.deliver_direct_reply(ctx, tx, &reply).await;
            }
            AnalyzerVerdict::MissingInfo { prompt } => {
                return self.deliver_direct_reply(ctx, tx, &prompt).await;
            }
            AnalyzerVerdict::Actionable => {}
        }

        // 任务创建 + TASK_EXEC
        let root = self
            .tasks
            .create_root(&ctx.session_id, &ctx.user_id, &task_name(utterance), utterance)
            .await?;
        *active_task = Some(root.id.clone());
        self.emit_task_event(ctx, tx, MessageKind::TaskExec, &root).await?;

        // 拆分：每个子任务一条 TASK_SPLIT，随后 TASK_SPLIT_FINISH，父任务进入执行中
        let descriptors = self.plan_split(utterance).await;
        let subtasks = self.tasks.split(&root.id, &descriptors).await?;
        for sub in &subtasks {
            self.emit_task_event(ctx, tx, MessageKind::TaskSplit, sub).await?;
        }
        let root = self.tasks.split_finish(&root.id).await?;
        self.emit_task_event(ctx, tx, MessageKind::TaskSplitFinish, &root).await?;

        // 能力集按轮构建：不可达端点被排除而非中止
        let dispatcher =
            ToolDispatcher::build_capability_set(endpoints, self.invoke_timeout_secs).await;

        for sub in &subtasks {
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }
            let started = self.tasks.start(&sub.id).await?;
            self.emit_task_event(ctx, tx, MessageKind::TaskStatusToLoading, &started)
                .await?;

            self.execute_subtask(ctx, sub, &dispatcher, tx, cancel).await?;

            let finished = self.tasks.finish(&sub.id).await?;
            self.emit_task_event(ctx, tx, MessageKind::TaskStatusToFinish, &finished)
                .await?;
        }
        Ok(())
    }

    /// 执行单个子任务：模型流 + 工具往返，直到模型给出最终文本
    async fn execute_subtask(
        &self,
        ctx: &TurnContext,
        sub: &Task,
        dispatcher: &ToolDispatcher,
        tx: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), TurnError> {
        let specs: Vec<ToolSpec> = dispatcher.tool_specs();

        for round in 0..self.max_tool_rounds {
            let mut history = self.load_model_history(&ctx.session_id).await?;
            // 子任务指令是窗口内的瞬时消息，不持久化
            history.push(Message::user(format!(
                "Current subtask: {}: {}",
                sub.name, sub.description
            )));
            let window = self
                .window
                .build(
                    &history,
                    &Message::system(&self.system_prompt),
                    ctx.budget_tokens,
                    ctx.strategy,
                )
                .await?;

            let (text, tool_calls) = self
                .stream_model(window.messages(), &specs, tx, cancel)
                .await?;

            if tool_calls.is_empty() {
                self.persist_assistant_text(ctx, &text).await?;
                return Ok(());
            }

            if !text.trim().is_empty() {
                self.persist_assistant_text(ctx, &text).await?;
            }
            self.dispatch_tool_calls(ctx, &tool_calls, dispatcher, tx, cancel)
                .await?;
            tracing::debug!("Subtask {} round {} done, continuing", sub.id, round + 1);
        }

        // 轮数触顶：以说明性文本收束本子任务
        tracing::warn!(
            "Subtask {} reached tool round limit ({})",
            sub.id,
            self.max_tool_rounds
        );
        let note = format!(
            "Reached tool round limit ({}) for this step.",
            self.max_tool_rounds
        );
        self.emit(tx, TurnEvent::last(MessageKind::Text, note.clone()))?;
        self.persist_assistant_text(ctx, &note).await?;
        Ok(())
    }

    /// 并发分发同一模型轮次的全部工具调用；ToolError 作为观察结果回注对话
    async fn dispatch_tool_calls(
        &self,
        ctx: &TurnContext,
        tool_calls: &[ToolCallRequest],
        dispatcher: &ToolDispatcher,
        tx: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), TurnError> {
        for call in tool_calls {
            let payload = serde_json::to_string(call).unwrap_or_default();
            self.emit(tx, TurnEvent::last(MessageKind::ToolCall, payload.clone()))?;
            self.sessions
                .append_message(
                    &ctx.session_id,
                    Message::assistant(payload)
                        .with_kind(MessageKind::ToolCall)
                        .with_provider(self.llm.provider()),
                )
                .await
                .map_err(TurnError::Store)?;
        }

        let invocations = tool_calls
            .iter()
            .map(|call| dispatcher.invoke(&call.name, call.arguments.clone()));
        let results = tokio::select! {
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            results = join_all(invocations) => results,
        };

        for (call, result) in tool_calls.iter().zip(results) {
            let observation = match result {
                Ok(content) => content,
                // 工具失败不终止轮次：以错误文本回注，模型自行应对
                Err(e) => format!("Error: {e}"),
            };
            self.sessions
                .append_message(
                    &ctx.session_id,
                    Message::user(format!("Observation from {}: {}", call.name, observation)),
                )
                .await
                .map_err(TurnError::Store)?;
        }
        Ok(())
    }

    /// 消费模型流：文本增量即时转发（推理增量带标记），工具调用请求收集后返回。
    /// 每个增量块边界检查取消。
    async fn stream_model(
        &self,
        messages: &[Message],
        specs: &[ToolSpec],
        tx: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<ToolCallRequest>), TurnError> {
        let mut stream = self
            .llm
            .complete_stream(messages, specs)
            .await
            .map_err(TurnError::ModelStream)?;

        let mut text = String::new();
        let mut calls: Vec<ToolCallRequest> = Vec::new();
        let mut emitted_text = false;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                next = stream.next() => next,
            };
            let chunk = match next {
                Some(chunk) => chunk.map_err(TurnError::ModelStream)?,
                None => break,
            };

            if !chunk.text_delta.is_empty() {
                self.emit(
                    tx,
                    TurnEvent::Delta {
                        kind: MessageKind::Text,
                        payload: chunk.text_delta.clone(),
                        is_last: false,
                        is_reasoning: chunk.is_reasoning,
                    },
                )?;
                if !chunk.is_reasoning {
                    text.push_str(&chunk.text_delta);
                }
                emitted_text = true;
            }
            if let Some(call) = chunk.tool_call {
                calls.push(call);
            }
        }

        if emitted_text {
            self.emit(tx, TurnEvent::last(MessageKind::Text, ""))?;
        }
        Ok((text, calls))
    }

    /// Analyzer 短路路径：恰好一条 TEXT 事件 + 持久化助手回复，不创建任务
    async fn deliver_direct_reply(
        &self,
        ctx: &TurnContext,
        tx: &mpsc::UnboundedSender<TurnEvent>,
        reply: &str,
    ) -> Result<(), TurnError> {
        self.emit(tx, TurnEvent::last(MessageKind::Text, reply))?;
        self.persist_assistant_text(ctx, reply).await
    }

    /// 任务指令：先投递事件，再以同类别标签持久化消息，两序一致
    async fn emit_task_event(
        &self,
        ctx: &TurnContext,
        tx: &mpsc::UnboundedSender<TurnEvent>,
        kind: MessageKind,
        task: &Task,
    ) -> Result<(), TurnError> {
        let payload = serde_json::to_string(task).unwrap_or_default();
        self.emit(tx, TurnEvent::last(kind, payload.clone()))?;
        self.sessions
            .append_message(
                &ctx.session_id,
                Message::assistant(payload)
                    .with_kind(kind)
                    .with_provider(self.llm.provider()),
            )
            .await
            .map_err(TurnError::Store)
    }

    /// 拆分规划：一次非流式调用产出有序步骤；失败时退化为单步
    async fn plan_split(&self, utterance: &str) -> Vec<SubtaskDescriptor> {
        let messages = vec![Message::system(SPLIT_PROMPT), Message::user(utterance)];
        let fallback = || {
            vec![SubtaskDescriptor {
                name: "execute".to_string(),
                description: utterance.to_string(),
            }]
        };

        let output = match self.llm.complete(&messages).await {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("Split planning failed ({}), using single step", e);
                return fallback();
            }
        };
        match parse_split(&output) {
            Some(descriptors) if !descriptors.is_empty() => descriptors,
            _ => {
                tracing::warn!("Split output unparseable, using single step");
                fallback()
            }
        }
    }

    async fn persist_assistant_text(
        &self,
        ctx: &TurnContext,
        text: &str,
    ) -> Result<(), TurnError> {
        self.sessions
            .append_message(
                &ctx.session_id,
                Message::assistant(text).with_provider(self.llm.provider()),
            )
            .await
            .map_err(TurnError::Store)
    }

    /// 进入模型上下文的历史：任务状态类指令消息被过滤
    async fn load_model_history(&self, session_id: &str) -> Result<Vec<Message>, TurnError> {
        let history = self
            .sessions
            .load_history(session_id)
            .await
            .map_err(TurnError::Store)?;
        Ok(history.into_iter().filter(|m| m.is_model_visible()).collect())
    }

    /// 发送事件；接收端已关闭视同调用方断开
    fn emit(&self, tx: &mpsc::UnboundedSender<TurnEvent>, event: TurnEvent) -> Result<(), TurnError> {
        tx.send(event).map_err(|_| TurnError::Cancelled)
    }

    fn begin_session(&self, session_id: &str) -> bool {
        self.active_sessions
            .lock()
            .unwrap()
            .insert(session_id.to_string())
    }

    fn end_session(&self, session_id: &str) {
        self.active_sessions.lock().unwrap().remove(session_id);
    }
}

/// 从用户输入生成任务名（截断）
fn task_name(utterance: &str) -> String {
    const MAX_CHARS: usize = 48;
    let trimmed = utterance.trim();
    if trimmed.chars().count() <= MAX_CHARS {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(MAX_CHARS).collect();
        format!("{head}...")
    }
}

/// 从模型输出中提取 JSON 数组并解析为拆分描述
fn parse_split(output: &str) -> Option<Vec<SubtaskDescriptor>> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else {
        let start = trimmed.find('[')?;
        let end = trimmed.rfind(']')?;
        &trimmed[start..=end]
    };
    serde_json::from_str(json_str).ok()
}
