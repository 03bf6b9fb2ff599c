//! Non-blocking notices for the status area. Nothing here ever asks for
//! focus; background failures and advisories queue up and expire on their
//! own.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::document::DocumentId;

const MAX_PENDING: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Info,
    Success,
    Warning,
    Error,
}

impl MessageType {
    fn default_duration(self) -> Duration {
        match self {
            MessageType::Info => Duration::from_secs(3),
            MessageType::Success => Duration::from_secs(2),
            MessageType::Warning => Duration::from_secs(5),
            MessageType::Error => Duration::from_secs(7),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub content: String,
    pub message_type: MessageType,
    /// Set when the notice is about one tab.
    pub document: Option<DocumentId>,
    pub created_at: Instant,
    pub auto_clear_duration: Option<Duration>,
}

impl StatusMessage {
    pub fn new(content: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            content: content.into(),
            message_type,
            document: None,
            created_at: Instant::now(),
            auto_clear_duration: Some(message_type.default_duration()),
        }
    }

    pub fn permanent(content: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            auto_clear_duration: None,
            ..Self::new(content, message_type)
        }
    }

    pub fn for_document(mut self, document: DocumentId) -> Self {
        self.document = Some(document);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.auto_clear_duration = Some(duration);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.auto_clear_duration
            .is_some_and(|duration| self.created_at.elapsed() > duration)
    }
}

#[derive(Debug, Default, Clone)]
pub struct StatusManager {
    pending: VecDeque<StatusMessage>,
}

impl StatusManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a notice. When the queue is full the oldest one is dropped.
    pub fn push(&mut self, message: StatusMessage) {
        match message.message_type {
            MessageType::Warning => log::warn!("{}", message.content),
            MessageType::Error => log::error!("{}", message.content),
            _ => log::debug!("status: {}", message.content),
        }
        if self.pending.len() == MAX_PENDING {
            self.pending.pop_front();
        }
        self.pending.push_back(message);
    }

    pub fn info(&mut self, content: impl Into<String>) {
        self.push(StatusMessage::new(content, MessageType::Info));
    }

    pub fn success(&mut self, content: impl Into<String>) {
        self.push(StatusMessage::new(content, MessageType::Success));
    }

    pub fn warning(&mut self, content: impl Into<String>) {
        self.push(StatusMessage::new(content, MessageType::Warning));
    }

    pub fn error(&mut self, content: impl Into<String>) {
        self.push(StatusMessage::new(content, MessageType::Error));
    }

    /// Drops expired notices; called once per tick.
    pub fn update(&mut self) {
        self.pending.retain(|message| !message.is_expired());
    }

    pub fn current(&self) -> Option<&StatusMessage> {
        self.pending.front()
    }

    pub fn dismiss(&mut self) -> Option<StatusMessage> {
        self.pending.pop_front()
    }

    pub fn messages(&self) -> impl Iterator<Item = &StatusMessage> {
        self.pending.iter()
    }

    /// Whether any queued notice mentions `document`.
    pub fn has_notice_for(&self, document: DocumentId) -> bool {
        self.pending.iter().any(|m| m.document == Some(document))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
