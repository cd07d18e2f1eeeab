//! Chat message format shared by every backend.

use serde::{Deserialize, Serialize};

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == MessageRole::User
    }

    /// Plain-text view of the content. Non-text blocks are skipped.
    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Message content (can be string or array of content blocks)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(bs) => bs
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Content block (for attachments alongside text)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub data: String, // base64 encoded or URL
}

/// The most recent message sent by the user, if any.
pub fn latest_user_message(messages: &[Message]) -> Option<&Message> {
    messages.iter().rev().find(|m| m.is_user())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_user_message_skips_assistant_turns() {
        let messages = vec![
            Message::system("be brief"),
            Message::user("first"),
            Message::assistant("answer"),
            Message::user("second"),
            Message::assistant("another answer"),
        ];
        assert_eq!(latest_user_message(&messages).map(|m| m.text()), Some("second".into()));
        assert!(latest_user_message(&[Message::system("only system")]).is_none());
    }

    #[test]
    fn test_block_content_text_joins_text_blocks() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text {
                text: "look at".into(),
            },
            ContentBlock::Image {
                source: ImageSource {
                    source_type: "url".into(),
                    media_type: None,
                    data: "https://example.com/chart.png".into(),
                },
            },
            ContentBlock::Text {
                text: "this chart".into(),
            },
        ]);
        assert_eq!(content.as_text(), "look at\nthis chart");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hi");
    }
}
