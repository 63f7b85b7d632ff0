//! Per-session audit trail
//!
//! Records client input only. PTY output is ANSI-heavy and uninteresting
//! for audit purposes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// One audited inbound message.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub event: &'static str,
    pub project_id: Uuid,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

/// Audit logger for a single terminal session.
pub struct AuditLogger {
    project_id: Uuid,
    user_id: String,
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLogger {
    pub fn new(project_id: Uuid, user_id: &str) -> Self {
        Self {
            project_id,
            user_id: user_id.to_string(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Record an inbound client message. Non-data frames are ignored.
    pub fn record(&self, message: &Message) {
        let content = match message {
            Message::Text(text) => text.clone(),
            Message::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            _ => return,
        };

        let entry = AuditEntry {
            event: "terminal_input",
            project_id: self.project_id,
            user_id: self.user_id.clone(),
            timestamp: Utc::now(),
            content,
        };

        tracing::info!(
            target: "sandbox_daemon::audit",
            "{}",
            serde_json::to_string(&entry).unwrap_or_default()
        );
        self.entries.lock().push(entry);
    }

    /// All entries recorded so far.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_text_and_binary_input() {
        let audit = AuditLogger::new(Uuid::new_v4(), "user-001");

        audit.record(&Message::Text("ls -la\n".to_string()));
        audit.record(&Message::Binary(b"echo hi\n".to_vec()));
        audit.record(&Message::Ping(vec![]));

        let entries = audit.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "terminal_input");
        assert_eq!(entries[0].content, "ls -la\n");
        assert_eq!(entries[1].content, "echo hi\n");
        assert_eq!(entries[0].user_id, "user-001");
    }

    #[test]
    fn lossy_decodes_non_utf8_input() {
        let audit = AuditLogger::new(Uuid::new_v4(), "user-001");
        audit.record(&Message::Binary(vec![0xff, 0xfe, b'a']));
        assert_eq!(audit.entries().len(), 1);
        assert!(audit.entries()[0].content.ends_with('a'));
    }
}
