//! Deterministic offline responder.
//!
//! Always available and never fails: it picks a canned answer by matching the
//! latest user message against a fixed list of topics. It is the terminal entry of
//! every attempt order.

use super::{Backend, BackendReply};
use crate::types::message::{latest_user_message, Message};
use crate::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;

struct Topic {
    pattern: Regex,
    reply: &'static str,
}

fn topic(pattern: &str, reply: &'static str) -> Option<Topic> {
    Regex::new(pattern).ok().map(|pattern| Topic { pattern, reply })
}

static TOPICS: Lazy<Vec<Topic>> = Lazy::new(|| {
    [
        topic(
            r"(?i)\b(budget|spend(ing)?|expenses?|save|saving|savings)\b",
            "A simple starting point is the 50/30/20 split: half of your income for needs, \
             30% for wants and 20% for savings. Track a month of expenses first so the \
             numbers reflect how you actually spend.",
        ),
        topic(
            r"(?i)\b(invest(ing|ment)?|stocks?|shares?|dividends?|portfolio)\b",
            "Diversification matters more than picking winners. Keep an emergency fund \
             before investing and prefer low-cost, broad funds for the long term.",
        ),
        topic(
            r"(?i)\b(debt|loan|credit card|interest)\b",
            "List your debts by interest rate and pay the most expensive one first while \
             keeping minimum payments on the rest.",
        ),
        topic(
            r"(?i)\b(focus|productiv(e|ity)|procrastinat\w*|tasks?|todo)\b",
            "Try working in 25-minute blocks with short breaks, and pick the single most \
             important task for the day before opening your inbox.",
        ),
        topic(
            r"(?i)\b(sleep|tired|insomnia|rest)\b",
            "Keep a consistent bedtime, dim screens an hour before sleep and avoid caffeine \
             late in the day.",
        ),
        topic(
            r"(?i)\b(stress(ed)?|anxious|anxiety|overwhelmed|breath(e|ing))\b",
            "Take a slow breath: in for four seconds, hold for four, out for six. Repeat a \
             few times and name one small thing you can do next.",
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
});

const GREETING: &str = "Hi! I can help with budgeting, investing basics, productivity and \
     wellbeing. What's on your mind?";

const DEFAULT_REPLY: &str = "I'm running in offline mode right now, so my answers are limited. \
     Ask me about budgeting, saving, investing, productivity, sleep or stress.";

#[derive(Debug, Default, Clone)]
pub struct OfflineBackend;

impl OfflineBackend {
    pub fn new() -> Self {
        Self
    }

    /// Pure reply selection; exposed so callers can preview the offline answer.
    pub fn reply_for(messages: &[Message]) -> &'static str {
        let Some(latest) = latest_user_message(messages) else {
            return GREETING;
        };
        let text = latest.text();
        if text.trim().is_empty() {
            return GREETING;
        }
        TOPICS
            .iter()
            .find(|t| t.pattern.is_match(&text))
            .map(|t| t.reply)
            .unwrap_or(DEFAULT_REPLY)
    }
}

#[async_trait]
impl Backend for OfflineBackend {
    async fn send_message(
        &self,
        _user_id: &str,
        messages: &[Message],
        _system_prompt: &str,
        _cancel: CancellationToken,
    ) -> Result<BackendReply> {
        Ok(BackendReply::new(Self::reply_for(messages)))
    }

    fn name(&self) -> &'static str {
        "offline"
    }
}
