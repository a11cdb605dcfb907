//! 投递通道事件
//!
//! 单订阅者、全序的推送流：带类别标签的载荷事件，以 Completed 或 Error
//! 终止标记收尾。流式文本以一条空载荷、is_last=true 的事件结束一条消息。

use serde::Serialize;

use crate::memory::MessageKind;

/// 一次轮次向调用方投递的事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 有类别标签的载荷
    Delta {
        kind: MessageKind,
        payload: String,
        is_last: bool,
        is_reasoning: bool,
    },
    /// 成功终止标记
    Completed,
    /// 错误终止标记
    Error { text: String },
}

impl TurnEvent {
    /// 流式中间块（is_last = false）
    pub fn delta(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self::Delta {
            kind,
            payload: payload.into(),
            is_last: false,
            is_reasoning: false,
        }
    }

    /// 一条消息的收尾块（is_last = true）
    pub fn last(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self::Delta {
            kind,
            payload: payload.into(),
            is_last: true,
            is_reasoning: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let ev = TurnEvent::last(MessageKind::TaskSplit, "{}");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "delta");
        assert_eq!(v["kind"], "TASK_SPLIT");
        assert_eq!(v["is_last"], true);

        assert!(TurnEvent::Completed.is_terminal());
        assert!(!TurnEvent::delta(MessageKind::Text, "x").is_terminal());
    }
}
