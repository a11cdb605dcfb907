//! 意图/完备性门（Analyzer）
//!
//! 轮次前置的一次廉价模型调用：判定输入是普通问题还是可执行任务，
//! 以及任务所需信息是否齐备。结果只在产生它的轮次内消费，从不存储。
//! 模型调用或解析失败时放行为可执行任务（门是加速路径，不做硬闸）。

use std::sync::Arc;

use serde::Deserialize;

use crate::llm::LlmClient;
use crate::memory::Message;

/// 分析结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerVerdict {
    /// 普通问题：直接以 reply 回复，轮次短路，不创建任务
    Question { reply: String },
    /// 任务但缺少必要信息：以 prompt 作为助手回复结束轮次，不创建任务
    MissingInfo { prompt: String },
    /// 信息齐备的可执行任务：进入任务创建/执行
    Actionable,
}

const ANALYZE_PROMPT: &str = r#"You are a pre-screening classifier for an AI agent.
Given the user's latest input and recent conversation, decide:
1. Is it a plain question or chat (answerable directly, no multi-step work)?
2. If it is an actionable task, does it contain all information required to start?

Output ONLY a JSON object, no explanation:
{"is_question": <bool>, "reply": "<direct answer if is_question>", "info_complete": <bool>, "missing_info_prompt": "<what to ask the user if info is missing>"}"#;

/// 历史上下文注入的最大条数
const HISTORY_CONTEXT_MESSAGES: usize = 6;

#[derive(Debug, Default, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    is_question: bool,
    #[serde(default)]
    reply: String,
    #[serde(default = "default_true")]
    info_complete: bool,
    #[serde(default)]
    missing_info_prompt: String,
}

fn default_true() -> bool {
    true
}

/// 意图识别器：单次模型调用，无跨调用状态
pub struct Analyzer {
    llm: Arc<dyn LlmClient>,
}

impl Analyzer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 分析用户输入。任一环节失败时放行（Actionable）并记录告警。
    pub async fn analyze(&self, utterance: &str, history: &[Message]) -> AnalyzerVerdict {
        let mut context = String::new();
        let recent = history
            .iter()
            .rev()
            .take(HISTORY_CONTEXT_MESSAGES)
            .collect::<Vec<_>>();
        for msg in recent.iter().rev() {
            context.push_str(&format!("{:?}: {}\n", msg.role, msg.content));
        }

        let messages = vec![
            Message::system(ANALYZE_PROMPT),
            Message::user(format!(
                "Recent conversation:\n{}\nLatest user input: {}",
                context, utterance
            )),
        ];

        let output = match self.llm.complete(&messages).await {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("Analyzer LLM call failed ({}), treating as actionable", e);
                return AnalyzerVerdict::Actionable;
            }
        };

        match parse_analysis(&output) {
            Some(raw) => {
                if raw.is_question {
                    AnalyzerVerdict::Question { reply: raw.reply }
                } else if !raw.info_complete {
                    AnalyzerVerdict::MissingInfo {
                        prompt: raw.missing_info_prompt,
                    }
                } else {
                    AnalyzerVerdict::Actionable
                }
            }
            None => {
                tracing::warn!("Analyzer output unparseable, treating as actionable");
                AnalyzerVerdict::Actionable
            }
        }
    }
}

/// 从模型输出中提取 JSON（```json 围栏或首尾花括号）并解析
fn parse_analysis(output: &str) -> Option<RawAnalysis> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        &trimmed[start..=end]
    };
    serde_json::from_str(json_str).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn analyzer_with(reply: &str) -> Analyzer {
        let mock = MockLlmClient::new();
        mock.push_completion(reply);
        Analyzer::new(Arc::new(mock))
    }

    #[tokio::test]
    async fn question_short_circuits() {
        let analyzer = analyzer_with(
            r#"{"is_question": true, "reply": "Paris.", "info_complete": true, "missing_info_prompt": ""}"#,
        );
        let verdict = analyzer.analyze("What is the capital of France?", &[]).await;
        assert_eq!(
            verdict,
            AnalyzerVerdict::Question {
                reply: "Paris.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn missing_info_returns_prompt() {
        let analyzer = analyzer_with(
            r#"{"is_question": false, "reply": "", "info_complete": false, "missing_info_prompt": "Which city?"}"#,
        );
        let verdict = analyzer.analyze("Book a hotel", &[]).await;
        assert_eq!(
            verdict,
            AnalyzerVerdict::MissingInfo {
                prompt: "Which city?".to_string()
            }
        );
    }

    #[tokio::test]
    async fn complete_task_is_actionable() {
        let analyzer = analyzer_with(
            r#"```json
{"is_question": false, "info_complete": true}
```"#,
        );
        let verdict = analyzer
            .analyze("Book a hotel in Berlin for tomorrow night", &[])
            .await;
        assert_eq!(verdict, AnalyzerVerdict::Actionable);
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_actionable() {
        let mock = MockLlmClient::new();
        mock.push_completion_err("timeout");
        let analyzer = Analyzer::new(Arc::new(mock));
        let verdict = analyzer.analyze("do something", &[]).await;
        assert_eq!(verdict, AnalyzerVerdict::Actionable);
    }

    #[tokio::test]
    async fn garbage_output_degrades_to_actionable() {
        let analyzer = analyzer_with("certainly! here is my analysis...");
        let verdict = analyzer.analyze("do something", &[]).await;
        assert_eq!(verdict, AnalyzerVerdict::Actionable);
    }
}
