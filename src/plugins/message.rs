//! 推送消息与批次
//!
//! `PushMessage` 序列化为推送通知的 JSON 格式：
//! `{"notification": {"tag", "card": {...}, "sound", "vibrate"}}`。
//! 卡片被抑制的消息不带 `card` 字段，只触发声音/振动。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 通知卡片（用户可见的内容）
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Card {
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    /// 点击动作 URI
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    /// 头像路径
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    /// epoch 秒
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub popup: bool,
    #[serde(default)]
    pub persist: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Notification {
    /// 由批次分配，消息自身不设置
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<Card>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sound: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub vibrate: bool,
    /// 被抑制的卡片，不序列化
    #[serde(skip)]
    pub suppressed_card: Option<Card>,
}

/// 单条推送消息
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub notification: Notification,
}

impl PushMessage {
    /// 标准消息：弹出并常驻的卡片
    pub fn standard(
        summary: impl Into<String>,
        body: impl Into<String>,
        action: impl Into<String>,
        icon: Option<String>,
        epoch: i64,
    ) -> Self {
        let action = action.into();
        let actions = if action.is_empty() { Vec::new() } else { vec![action] };

        Self {
            notification: Notification {
                tag: String::new(),
                card: Some(Card {
                    summary: summary.into(),
                    body: body.into(),
                    actions,
                    icon: icon.unwrap_or_default(),
                    timestamp: epoch,
                    popup: true,
                    persist: true,
                }),
                sound: true,
                vibrate: true,
                suppressed_card: None,
            },
        }
    }

    pub fn tag(&self) -> &str {
        &self.notification.tag
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.notification.tag = tag.into();
    }

    pub fn summary(&self) -> Option<&str> {
        self.notification.card.as_ref().map(|c| c.summary.as_str())
    }

    /// 卡片被抑制后仍返回原来的动作
    pub fn action(&self) -> Option<&str> {
        self.notification
            .card
            .as_ref()
            .or(self.notification.suppressed_card.as_ref())
            .and_then(|c| c.actions.first())
            .map(String::as_str)
    }

    /// 去掉卡片，保留声音/振动等副作用
    pub fn suppress_card(&mut self) {
        if let Some(card) = self.notification.card.take() {
            self.notification.suppressed_card = Some(card);
        }
    }

    pub fn is_card_suppressed(&self) -> bool {
        self.notification.card.is_none()
    }
}

/// 溢出处理：把超出上限的消息合并成一条
pub type OverflowHandler = Arc<dyn Fn(&[PushMessage]) -> PushMessage + Send + Sync>;

/// 同一 tag 下的一组消息，共享显示上限和溢出策略
#[derive(Clone)]
pub struct PushMessageBatch {
    pub messages: Vec<PushMessage>,
    pub tag: String,
    /// 最多单独显示的条数
    pub limit: usize,
    pub overflow_handler: OverflowHandler,
}

impl PushMessageBatch {
    pub fn new(
        tag: impl Into<String>,
        limit: usize,
        messages: Vec<PushMessage>,
        overflow_handler: OverflowHandler,
    ) -> Self {
        Self {
            messages,
            tag: tag.into(),
            limit,
            overflow_handler,
        }
    }

    /// 无显示上限的批次（helper 输出使用）
    pub fn unlimited(tag: impl Into<String>, messages: Vec<PushMessage>) -> Self {
        Self::new(tag, usize::MAX, messages, Arc::new(default_overflow))
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

impl fmt::Debug for PushMessageBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushMessageBatch")
            .field("tag", &self.tag)
            .field("limit", &self.limit)
            .field("messages", &self.messages)
            .finish_non_exhaustive()
    }
}

/// 默认的溢出合并：一条 "N more notifications"
pub fn default_overflow(messages: &[PushMessage]) -> PushMessage {
    let senders: Vec<&str> = messages.iter().filter_map(|m| m.summary()).collect();
    let body = if senders.is_empty() {
        String::new()
    } else {
        format!("From {}", senders.join(", "))
    };

    PushMessage::standard(
        format!("{} more notifications", messages.len()),
        body,
        "",
        None,
        chrono::Utc::now().timestamp(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_message_json_shape() {
        let msg = PushMessage::standard("Alice", "Hi there", "https://mail/1", None, 1_400_000_000);
        let json = serde_json::to_value(&msg).unwrap();

        let card = &json["notification"]["card"];
        assert_eq!(card["summary"], "Alice");
        assert_eq!(card["body"], "Hi there");
        assert_eq!(card["actions"][0], "https://mail/1");
        assert_eq!(card["timestamp"], 1_400_000_000i64);
        assert_eq!(card["popup"], true);
        assert_eq!(card["persist"], true);
        assert!(card.get("icon").is_none());
        assert_eq!(json["notification"]["sound"], true);
    }

    #[test]
    fn test_suppressed_card_keeps_tag_and_sound() {
        let mut msg = PushMessage::standard("s", "b", "act", None, 0);
        msg.set_tag("t-overflow");
        msg.suppress_card();

        assert!(msg.is_card_suppressed());
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["notification"].get("card").is_none());
        assert_eq!(json["notification"]["tag"], "t-overflow");
        assert_eq!(json["notification"]["sound"], true);
        assert_eq!(msg.action(), Some("act"));
    }

    #[test]
    fn test_parse_helper_output() {
        let raw = r#"[{"notification": {"card": {"summary": "one", "popup": true}}}, {}]"#;
        let msgs: Vec<PushMessage> = serde_json::from_str(raw).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].summary(), Some("one"));
        assert!(msgs[1].is_card_suppressed());
    }

    #[test]
    fn test_default_overflow_lists_senders() {
        let msgs = vec![
            PushMessage::standard("Bob", "", "", None, 0),
            PushMessage::standard("Carol", "", "", None, 0),
        ];
        let merged = default_overflow(&msgs);
        assert_eq!(merged.summary(), Some("2 more notifications"));
        assert_eq!(
            merged.notification.card.as_ref().map(|c| c.body.as_str()),
            Some("From Bob, Carol")
        );
    }
}
