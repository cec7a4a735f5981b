//! User-visible notifications raised by the board.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::TaskId;

/// Maximum history entries to keep
const MAX_HISTORY_ENTRIES: usize = 100;

/// Notification level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    /// Neutral notice, e.g. "saved for later"
    Info,
    Success,
    /// Something degraded but the board is still usable
    Warning,
    /// A change was rejected and reverted
    Error,
}

impl NotificationLevel {
    /// Get icon/prefix for this level
    pub fn icon(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "ℹ",
            NotificationLevel::Success => "✓",
            NotificationLevel::Warning => "⚠",
            NotificationLevel::Error => "✗",
        }
    }
}

/// A single notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: u64,
    pub level: NotificationLevel,
    pub message: String,
    /// Task the notification is about, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// One-line human rendering.
    pub fn render(&self) -> String {
        format!("{} {}", self.level.icon(), self.message)
    }
}

/// Notification history, newest last, capped at [`MAX_HISTORY_ENTRIES`].
#[derive(Debug)]
pub struct Notifier {
    history: VecDeque<Notification>,
    next_id: u64,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            history: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Record a notification and return it.
    pub fn notify(
        &mut self,
        level: NotificationLevel,
        message: impl Into<String>,
        task_id: Option<TaskId>,
    ) -> Notification {
        let notification = Notification {
            id: self.next_id,
            level,
            message: message.into(),
            task_id,
            timestamp: Utc::now(),
        };
        self.next_id += 1;

        self.history.push_back(notification.clone());
        while self.history.len() > MAX_HISTORY_ENTRIES {
            self.history.pop_front();
        }
        notification
    }

    pub fn history(&self) -> impl Iterator<Item = &Notification> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_assigns_increasing_ids() {
        let mut notifier = Notifier::new();
        let a = notifier.notify(NotificationLevel::Info, "one", None);
        let b = notifier.notify(NotificationLevel::Error, "two", Some(42));
        assert_eq!(a.id + 1, b.id);
        assert_eq!(b.task_id, Some(42));
        assert_eq!(b.render(), "✗ two");
    }

    #[test]
    fn test_history_is_capped() {
        let mut notifier = Notifier::new();
        for i in 0..(MAX_HISTORY_ENTRIES + 10) {
            notifier.notify(NotificationLevel::Info, format!("n{}", i), None);
        }
        assert_eq!(notifier.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(notifier.history().next().unwrap().message, "n10");
    }
}
