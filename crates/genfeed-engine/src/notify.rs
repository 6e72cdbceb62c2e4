use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

/// Where user-facing mutation failures end up.
pub trait Notifier: Send {
    fn notify_error(&self, title: &str, message: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn notify_error(&self, title: &str, message: &str) {
        eprintln!("{title}: {message}");
    }
}

/// Keeps notifications in memory; clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    entries: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Notification> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_error(&self, title: &str, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(Notification {
                title: title.to_string(),
                message: message.to_string(),
            });
        }
    }
}
