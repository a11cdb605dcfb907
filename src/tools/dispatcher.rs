//! 工具调用分发器
//!
//! build_capability_set 为每个端点 URL 建立一个客户端，把各端点目录合并为
//! 暴露给模型的单一能力集；重名工具按先注册者优先解析（固定规则，非任意）。
//! 目录构建时不可达的端点被排除而非中止整个构建；invoke 失败作为 ToolError
//! 回注模型流，不终止轮次。每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::TurnError;
use crate::llm::ToolSpec;
use crate::tools::{ToolDefinition, ToolEndpoint};

/// 能力集中的一个条目：定义 + 所属端点
struct CatalogEntry {
    definition: ToolDefinition,
    endpoint: Arc<dyn ToolEndpoint>,
}

/// 工具分发器：轮次内的瞬时能力集
pub struct ToolDispatcher {
    /// 注册顺序保存，重名时下标小者胜出
    catalog: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
    invoke_timeout: Duration,
}

impl ToolDispatcher {
    /// 从端点列表构建能力集。端点目录查询失败时记录告警并跳过该端点
    /// （部分可用策略）；重名工具先注册者优先。
    pub async fn build_capability_set(
        endpoints: Vec<Arc<dyn ToolEndpoint>>,
        invoke_timeout_secs: u64,
    ) -> Self {
        let mut catalog: Vec<CatalogEntry> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for endpoint in endpoints {
            let tools = match endpoint.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!("Tool endpoint {} unreachable, excluded: {}", endpoint.url(), e);
                    continue;
                }
            };
            for definition in tools {
                if index.contains_key(&definition.name) {
                    tracing::debug!(
                        "Duplicate tool {} from {}, first registration wins",
                        definition.name,
                        endpoint.url()
                    );
                    continue;
                }
                index.insert(definition.name.clone(), catalog.len());
                catalog.push(CatalogEntry {
                    definition,
                    endpoint: Arc::clone(&endpoint),
                });
            }
        }

        Self {
            catalog,
            index,
            invoke_timeout: Duration::from_secs(invoke_timeout_secs),
        }
    }

    /// 暴露给模型的工具说明列表（注册顺序）
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.catalog
            .iter()
            .map(|e| ToolSpec {
                name: e.definition.name.clone(),
                description: e.definition.description.clone(),
                parameters: e.definition.parameters.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    /// 调用工具；失败映射为 TurnError::Tool / UnknownTool，由调用方回注模型流
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, TurnError> {
        let entry = self
            .index
            .get(name)
            .map(|i| &self.catalog[*i])
            .ok_or_else(|| TurnError::UnknownTool(name.to_string()))?;

        let start = Instant::now();
        let result = timeout(
            self.invoke_timeout,
            entry.endpoint.call(name, arguments.clone()),
        )
        .await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "endpoint": entry.endpoint.url(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(reason)) => Err(TurnError::Tool {
                tool: name.to_string(),
                reason,
            }),
            Err(_) => Err(TurnError::Tool {
                tool: name.to_string(),
                reason: "timeout".to_string(),
            }),
        }
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    /// 静态端点：固定目录，调用时回显端点名
    struct StaticEndpoint {
        url: String,
        tools: Vec<ToolDefinition>,
        fail_listing: bool,
        fail_calls: bool,
    }

    impl StaticEndpoint {
        fn new(url: &str, tool_names: &[&str]) -> Arc<dyn ToolEndpoint> {
            Arc::new(Self {
                url: url.to_string(),
                tools: tool_names
                    .iter()
                    .map(|n| ToolDefinition {
                        name: n.to_string(),
                        description: format!("{n} tool"),
                        parameters: serde_json::json!({"type": "object"}),
                    })
                    .collect(),
                fail_listing: false,
                fail_calls: false,
            })
        }

        fn unreachable(url: &str) -> Arc<dyn ToolEndpoint> {
            Arc::new(Self {
                url: url.to_string(),
                tools: vec![],
                fail_listing: true,
                fail_calls: false,
            })
        }

        fn failing_calls(url: &str, tool_names: &[&str]) -> Arc<dyn ToolEndpoint> {
            Arc::new(Self {
                url: url.to_string(),
                tools: tool_names
                    .iter()
                    .map(|n| ToolDefinition {
                        name: n.to_string(),
                        description: String::new(),
                        parameters: Value::Null,
                    })
                    .collect(),
                fail_listing: false,
                fail_calls: true,
            })
        }
    }

    #[async_trait]
    impl ToolEndpoint for StaticEndpoint {
        fn url(&self) -> &str {
            &self.url
        }

        async fn list_tools(&self) -> Result<Vec<ToolDefinition>, String> {
            if self.fail_listing {
                return Err("connection refused".to_string());
            }
            Ok(self.tools.clone())
        }

        async fn call(&self, name: &str, _arguments: Value) -> Result<String, String> {
            if self.fail_calls {
                return Err(format!("{name} exploded"));
            }
            Ok(format!("{} from {}", name, self.url))
        }
    }

    #[tokio::test]
    async fn duplicate_tool_resolves_to_first_registered() {
        let dispatcher = ToolDispatcher::build_capability_set(
            vec![
                StaticEndpoint::new("http://a", &["search", "fetch"]),
                StaticEndpoint::new("http://b", &["search", "translate"]),
            ],
            5,
        )
        .await;

        // 目录只含一个 search，来自先注册的端点
        assert_eq!(dispatcher.len(), 3);
        let result = dispatcher.invoke("search", Value::Null).await.unwrap();
        assert_eq!(result, "search from http://a");
        // b 独有的工具正常路由
        let result = dispatcher.invoke("translate", Value::Null).await.unwrap();
        assert_eq!(result, "translate from http://b");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_excluded_not_fatal() {
        let dispatcher = ToolDispatcher::build_capability_set(
            vec![
                StaticEndpoint::unreachable("http://down"),
                StaticEndpoint::new("http://up", &["echo"]),
            ],
            5,
        )
        .await;
        assert_eq!(dispatcher.len(), 1);
        assert_eq!(dispatcher.tool_specs()[0].name, "echo");
    }

    #[tokio::test]
    async fn invoke_failure_surfaces_as_tool_error() {
        let dispatcher = ToolDispatcher::build_capability_set(
            vec![StaticEndpoint::failing_calls("http://a", &["boom"])],
            5,
        )
        .await;

        match dispatcher.invoke("boom", Value::Null).await {
            Err(TurnError::Tool { tool, reason }) => {
                assert_eq!(tool, "boom");
                assert!(reason.contains("exploded"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let dispatcher = ToolDispatcher::build_capability_set(vec![], 5).await;
        assert!(matches!(
            dispatcher.invoke("nope", Value::Null).await,
            Err(TurnError::UnknownTool(_))
        ));
    }
}
