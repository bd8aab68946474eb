//! Engine notifications: validation findings and runtime warnings.
//!
//! Notifications are informational. Nothing in the engine branches on
//! whether a listener saw one.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    /// Description of the offending node, e.g. `divide in SCORE`.
    pub node: String,
}

impl Notification {
    pub fn new(level: NotificationLevel, node: impl Into<String>, message: impl Into<String>) -> Self {
        Notification {
            level,
            message: message.into(),
            node: node.into(),
        }
    }

    pub fn error(node: impl Into<String>, message: impl Into<String>) -> Self {
        Notification::new(NotificationLevel::Error, node, message)
    }

    pub fn warning(node: impl Into<String>, message: impl Into<String>) -> Self {
        Notification::new(NotificationLevel::Warning, node, message)
    }

    pub fn info(node: impl Into<String>, message: impl Into<String>) -> Self {
        Notification::new(NotificationLevel::Info, node, message)
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.level, self.node, self.message)
    }
}

/// Receives notifications raised while validating or running content.
pub trait NotificationListener: Send + Sync {
    fn on_notification(&self, notification: &Notification);
}

/// Forwards notifications to `tracing` at the matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl NotificationListener for TracingListener {
    fn on_notification(&self, n: &Notification) {
        match n.level {
            NotificationLevel::Info => tracing::info!(node = %n.node, "{}", n.message),
            NotificationLevel::Warning => tracing::warn!(node = %n.node, "{}", n.message),
            NotificationLevel::Error => tracing::error!(node = %n.node, "{}", n.message),
        }
    }
}

/// Keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingListener {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        match self.seen.lock() {
            Ok(seen) => seen.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NotificationListener for RecordingListener {
    fn on_notification(&self, notification: &Notification) {
        match self.seen.lock() {
            Ok(mut seen) => seen.push(notification.clone()),
            Err(poisoned) => poisoned.into_inner().push(notification.clone()),
        }
    }
}

// ──────────────────────────────────────────────
// Validation reports
// ──────────────────────────────────────────────

/// Findings from static validation of a definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub findings: Vec<Notification>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, notification: Notification) {
        self.findings.push(notification);
    }

    pub fn error(&mut self, node: impl Into<String>, message: impl Into<String>) {
        self.push(Notification::error(node, message));
    }

    pub fn warning(&mut self, node: impl Into<String>, message: impl Into<String>) {
        self.push(Notification::warning(node, message));
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Notification> {
        self.findings
            .iter()
            .filter(|n| n.level == NotificationLevel::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Notification> {
        self.findings
            .iter()
            .filter(|n| n.level == NotificationLevel::Warning)
    }

    pub fn extend(&mut self, other: ValidationReport) {
        self.findings.extend(other.findings);
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }
}
