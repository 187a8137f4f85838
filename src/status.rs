use chrono::{DateTime, Local};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageType {
    Trace,
    Info,
    Warning,
    Error,
    Priority,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Trace => write!(f, "Trace"),
            MessageType::Info => write!(f, "Info"),
            MessageType::Warning => write!(f, "Warning"),
            MessageType::Error => write!(f, "Error"),
            MessageType::Priority => write!(f, "Priority"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StatusMessage {
    pub timestamp: DateTime<Local>,
    pub message_type: MessageType,
    pub content: String,
}

impl StatusMessage {
    pub fn new(message_type: MessageType, content: String) -> Self {
        StatusMessage {
            timestamp: Local::now(),
            message_type,
            content,
        }
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.message_type,
            self.content
        )
    }
}

/// The observability sink. Every anomaly the engine notices (replays, MIC
/// failures, reserved-bit violations, zero-TK usage, ...) lands here as a
/// leveled, human-readable note, mirrored to `tracing`.
pub struct MessageLog {
    messages: Vec<StatusMessage>,
    max_size: Option<usize>,
}

impl MessageLog {
    pub fn new(max_size: Option<usize>) -> Self {
        MessageLog {
            messages: Vec::new(),
            max_size,
        }
    }

    pub fn add_message(&mut self, message: StatusMessage) {
        match message.message_type {
            MessageType::Trace => tracing::trace!("{}", message.content),
            MessageType::Info => tracing::info!("{}", message.content),
            MessageType::Warning => tracing::warn!("{}", message.content),
            MessageType::Error => tracing::error!("{}", message.content),
            MessageType::Priority => tracing::info!(priority = true, "{}", message.content),
        }
        self.messages.push(message);
        if let Some(max) = self.max_size {
            if self.messages.len() > max {
                let excess = self.messages.len() - max;
                self.messages.drain(..excess);
            }
        }
    }

    pub fn messages(&self) -> &[StatusMessage] {
        &self.messages
    }

    /// Count of messages at a given level, mostly useful in tests.
    pub fn count(&self, message_type: MessageType) -> usize {
        self.messages
            .iter()
            .filter(|m| m.message_type == message_type)
            .count()
    }

    /// True if any logged message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.iter().any(|m| m.content.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_caps_at_max_size() {
        let mut log = MessageLog::new(Some(3));
        for i in 0..5 {
            log.add_message(StatusMessage::new(MessageType::Info, format!("msg {}", i)));
        }
        assert_eq!(log.messages().len(), 3);
        assert_eq!(log.messages()[0].content, "msg 2");
    }

    #[test]
    fn level_counting() {
        let mut log = MessageLog::new(None);
        log.add_message(StatusMessage::new(MessageType::Warning, "w".to_string()));
        log.add_message(StatusMessage::new(MessageType::Info, "i".to_string()));
        assert_eq!(log.count(MessageType::Warning), 1);
        assert!(log.contains("w"));
        assert!(!log.contains("x"));
    }
}
