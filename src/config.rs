//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，
//! 如 `HIVE__LLM__TOKEN_BUDGET=16000`）。端点列表来自工具管理协作方的配置，
//! 按轮次注入编排器，不存在全局可变端点池。

use std::path::PathBuf;

use serde::Deserialize;

use crate::memory::{OverflowStrategy, SummarizeConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub summarize: SummarizeSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [app] 段：应用名
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择、token 预算与溢出策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock；无 API Key 时自动退回 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 每轮模型上下文 token 预算
    pub token_budget: usize,
    /// 溢出策略：NONE / SLIDING_WINDOW / SUMMARIZE
    pub overflow_strategy: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            token_budget: 8000,
            overflow_strategy: "SLIDING_WINDOW".to_string(),
        }
    }
}

impl LlmSection {
    /// 解析溢出策略；非法值退回 SLIDING_WINDOW 并告警
    pub fn strategy(&self) -> OverflowStrategy {
        OverflowStrategy::parse(&self.overflow_strategy).unwrap_or_else(|| {
            tracing::warn!(
                "Unknown overflow strategy {:?}, using SLIDING_WINDOW",
                self.overflow_strategy
            );
            OverflowStrategy::SlidingWindow
        })
    }
}

/// [summarize] 段：摘要调用的分块参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummarizeSection {
    pub chunk_chars: usize,
    pub overlap_chars: usize,
    pub max_summary_tokens: usize,
}

impl Default for SummarizeSection {
    fn default() -> Self {
        let d = SummarizeConfig::default();
        Self {
            chunk_chars: d.chunk_chars,
            overlap_chars: d.overlap_chars,
            max_summary_tokens: d.max_summary_tokens,
        }
    }
}

impl SummarizeSection {
    pub fn to_summarize_config(&self) -> SummarizeConfig {
        SummarizeConfig {
            chunk_chars: self.chunk_chars,
            overlap_chars: self.overlap_chars,
            max_summary_tokens: self.max_summary_tokens,
        }
    }
}

/// [tools] 段：工具端点 URL 列表与调用超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 可用工具端点（连接 URL）
    pub endpoints: Vec<String>,
    /// 单次工具调用超时（秒）
    pub invoke_timeout_secs: u64,
    /// 单个子任务内模型与工具往返的上限
    pub max_tool_rounds: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            invoke_timeout_secs: 30,
            max_tool_rounds: 8,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            summarize: SummarizeSection::default(),
            tools: ToolsSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.token_budget, 8000);
        assert_eq!(cfg.llm.strategy(), OverflowStrategy::SlidingWindow);
        assert!(cfg.tools.endpoints.is_empty());
    }

    #[test]
    fn invalid_strategy_falls_back() {
        let section = LlmSection {
            overflow_strategy: "bogus".to_string(),
            ..LlmSection::default()
        };
        assert_eq!(section.strategy(), OverflowStrategy::SlidingWindow);
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[llm]\ntoken_budget = 1234\noverflow_strategy = \"SUMMARIZE\"\n\n[tools]\nendpoints = [\"http://localhost:9001\"]"
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.llm.token_budget, 1234);
        assert_eq!(cfg.llm.strategy(), OverflowStrategy::Summarize);
        assert_eq!(cfg.tools.endpoints, vec!["http://localhost:9001".to_string()]);
    }
}
