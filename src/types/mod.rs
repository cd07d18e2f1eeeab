//! Core type definitions.

pub mod message;

pub use message::{latest_user_message, ContentBlock, Message, MessageContent, MessageRole};
