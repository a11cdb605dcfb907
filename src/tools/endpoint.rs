//! 工具端点
//!
//! 远程工具源的抽象：list_tools 返回目录，call 执行调用。
//! HttpToolEndpoint 通过 JSON POST 与给定 URL 的端点通信；
//! 端点身份对模型不可见，由 Dispatcher 负责路由。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 端点目录中的一个工具定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 参数 JSON Schema；缺省表示无参数约束
    #[serde(default = "default_parameters")]
    pub parameters: Value,
}

fn default_parameters() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

/// 工具端点 trait：目录查询与调用
#[async_trait]
pub trait ToolEndpoint: Send + Sync {
    /// 端点连接 URL（日志与审计用）
    fn url(&self) -> &str;

    /// 列出该端点暴露的全部工具
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, String>;

    /// 调用端点上的一个工具
    async fn call(&self, name: &str, arguments: Value) -> Result<String, String>;
}

#[derive(Deserialize)]
struct ListToolsResponse {
    tools: Vec<ToolDefinition>,
}

#[derive(Deserialize)]
struct CallToolResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    is_error: bool,
}

/// HTTP JSON 端点客户端：每轮次建立，不跨轮次保留
pub struct HttpToolEndpoint {
    url: String,
    client: reqwest::Client,
}

impl HttpToolEndpoint {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl ToolEndpoint for HttpToolEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, String> {
        let body = serde_json::json!({ "method": "tools/list" });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let parsed: ListToolsResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(parsed.tools)
    }

    async fn call(&self, name: &str, arguments: Value) -> Result<String, String> {
        let body = serde_json::json!({
            "method": "tools/call",
            "name": name,
            "arguments": arguments,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let parsed: CallToolResponse = response.json().await.map_err(|e| e.to_string())?;
        if parsed.is_error {
            Err(parsed.content)
        } else {
            Ok(parsed.content)
        }
    }
}

/// 按配置的 URL 列表建立 HTTP 端点客户端（每轮次调用，池不跨轮保留）
pub fn endpoints_from_urls(
    urls: &[String],
    timeout_secs: u64,
) -> Vec<std::sync::Arc<dyn ToolEndpoint>> {
    urls.iter()
        .map(|u| {
            std::sync::Arc::new(HttpToolEndpoint::new(u, timeout_secs))
                as std::sync::Arc<dyn ToolEndpoint>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_definition_defaults_parameters() {
        let def: ToolDefinition =
            serde_json::from_value(serde_json::json!({ "name": "search" })).unwrap();
        assert_eq!(def.name, "search");
        assert_eq!(def.parameters["type"], "object");
    }
}
