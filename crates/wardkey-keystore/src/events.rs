//! Security event reporting.
//!
//! Every event renders as one line:
//!
//! ```text
//! SECURITY EVENT: <eventType> - <details> (User: <userId>)
//! ```
//!
//! Details are redacted before an event is built, so no sink ever sees
//! raw secrets.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::Clock;
use crate::redact::redact;

/// User segment for events not tied to a user.
pub const SYSTEM_USER: &str = "system";

/// Kinds of security event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    /// Stored verification code failed its integrity check.
    VerificationCodeTampered,
    /// Stored PIN hash, salt or tag failed its integrity check.
    PinTampered,
    /// A key rotation completed.
    KeyRotation,
    /// A rotation failed and was rolled back.
    KeyRotationFailed,
    /// Rollback was impossible; emergency recovery started or failed.
    KeyRotationCritical,
    /// Emergency recovery reset the key set to version 1.
    KeyRotationEmergency,
    /// A due rotation was skipped because recovery is pending.
    KeyRotationSkipped,
    /// An interrupted rotation was resolved at startup.
    KeyRotationRecovered,
    /// An identity reached the failed-attempt threshold.
    AccountLockedOut,
    /// A PIN is older than the recommended age.
    PinRotationRecommended,
}

impl SecurityEventKind {
    /// Wire name of the event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VerificationCodeTampered => "verification_code_tampered",
            Self::PinTampered => "pin_tampered",
            Self::KeyRotation => "key_rotation",
            Self::KeyRotationFailed => "key_rotation_failed",
            Self::KeyRotationCritical => "key_rotation_critical",
            Self::KeyRotationEmergency => "key_rotation_emergency",
            Self::KeyRotationSkipped => "key_rotation_skipped",
            Self::KeyRotationRecovered => "key_rotation_recovered",
            Self::AccountLockedOut => "account_locked_out",
            Self::PinRotationRecommended => "pin_rotation_recommended",
        }
    }

    /// `true` for events an operator must act on.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(self, Self::KeyRotationCritical | Self::KeyRotationEmergency)
    }

    /// `true` for integrity failures on stored credentials.
    #[must_use]
    pub const fn is_tamper(self) -> bool {
        matches!(self, Self::PinTampered | Self::VerificationCodeTampered)
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded security event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    /// What happened.
    pub kind: SecurityEventKind,
    /// Redacted free-text details.
    pub details: String,
    /// Affected user, `None` for system events.
    pub user: Option<String>,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl SecurityEvent {
    /// Build an event, redacting `details`.
    #[must_use]
    pub fn new(kind: SecurityEventKind, details: &str, user: Option<&str>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            details: redact(details),
            user: user.map(str::to_owned),
            at,
        }
    }
}

impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SECURITY EVENT: {} - {} (User: {})",
            self.kind,
            self.details,
            self.user.as_deref().unwrap_or(SYSTEM_USER)
        )
    }
}

/// Destination for security events.
pub trait SecurityEventSink: Send + Sync {
    /// Deliver one event. Must not fail.
    fn record(&self, event: &SecurityEvent);
}

/// Emits events through `tracing` on the `security` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl SecurityEventSink for TracingSink {
    fn record(&self, event: &SecurityEvent) {
        let kind = event.kind.as_str();
        if event.kind.is_critical() {
            tracing::error!(target: "security", event_type = kind, "{event}");
        } else {
            tracing::warn!(target: "security", event_type = kind, "{event}");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemorySink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    /// Kinds of all recorded events, oldest first.
    #[must_use]
    pub fn kinds(&self) -> Vec<SecurityEventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }

    /// Number of events of `kind`.
    #[must_use]
    pub fn count(&self, kind: SecurityEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl SecurityEventSink for MemorySink {
    fn record(&self, event: &SecurityEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Stamps, redacts and forwards events to a sink.
#[derive(Clone)]
pub struct SecurityLog {
    sink: Arc<dyn SecurityEventSink>,
    clock: Arc<dyn Clock>,
}

impl SecurityLog {
    /// Wire a sink and a clock.
    #[must_use]
    pub fn new(sink: Arc<dyn SecurityEventSink>, clock: Arc<dyn Clock>) -> Self {
        Self { sink, clock }
    }

    /// Record an event about `user`.
    pub fn user_event(&self, kind: SecurityEventKind, user: &str, details: &str) {
        self.emit(kind, Some(user), details);
    }

    /// Record an event with no user.
    pub fn system_event(&self, kind: SecurityEventKind, details: &str) {
        self.emit(kind, None, details);
    }

    fn emit(&self, kind: SecurityEventKind, user: Option<&str>, details: &str) {
        let event = SecurityEvent::new(kind, details, user, self.clock.now());
        self.sink.record(&event);
    }
}

impl fmt::Debug for SecurityLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityLog").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn log_with_memory() -> (SecurityLog, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let clock = Arc::new(ManualClock::new(DateTime::from_timestamp_millis(0).unwrap()));
        (SecurityLog::new(sink.clone(), clock), sink)
    }

    #[test]
    fn line_format_with_user() {
        let event = SecurityEvent::new(
            SecurityEventKind::PinTampered,
            "hmac mismatch",
            Some("u1"),
            DateTime::from_timestamp_millis(0).unwrap(),
        );
        assert_eq!(
            event.to_string(),
            "SECURITY EVENT: pin_tampered - hmac mismatch (User: u1)"
        );
    }

    #[test]
    fn line_format_without_user() {
        let (log, sink) = log_with_memory();
        log.system_event(SecurityEventKind::KeyRotationSkipped, "recovery pending");
        assert_eq!(
            sink.events()[0].to_string(),
            "SECURITY EVENT: key_rotation_skipped - recovery pending (User: system)"
        );
    }

    #[test]
    fn details_are_redacted() {
        let (log, sink) = log_with_memory();
        log.user_event(
            SecurityEventKind::VerificationCodeTampered,
            "u1",
            "header Bearer abc.def.ghi",
        );
        let event = &sink.events()[0];
        assert!(!event.details.contains("abc.def.ghi"));
        assert!(event.details.contains("[REDACTED]"));
    }

    #[test]
    fn memory_sink_counts_and_clears() {
        let (log, sink) = log_with_memory();
        log.system_event(SecurityEventKind::KeyRotation, "1 -> 2");
        log.system_event(SecurityEventKind::KeyRotation, "2 -> 3");
        log.user_event(SecurityEventKind::AccountLockedOut, "u1", "5 failures");
        assert_eq!(sink.count(SecurityEventKind::KeyRotation), 2);
        assert_eq!(
            sink.kinds(),
            vec![
                SecurityEventKind::KeyRotation,
                SecurityEventKind::KeyRotation,
                SecurityEventKind::AccountLockedOut
            ]
        );
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn kind_classification() {
        assert!(SecurityEventKind::KeyRotationEmergency.is_critical());
        assert!(!SecurityEventKind::KeyRotationFailed.is_critical());
        assert!(SecurityEventKind::PinTampered.is_tamper());
        assert_eq!(
            SecurityEventKind::KeyRotationRecovered.to_string(),
            "key_rotation_recovered"
        );
    }

    #[test]
    fn serializes_for_export() {
        let event = SecurityEvent::new(
            SecurityEventKind::KeyRotationSkipped,
            "recovery pending",
            None,
            DateTime::from_timestamp_millis(0).unwrap(),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "key_rotation_skipped");
        assert_eq!(json["details"], "recovery pending");
        assert!(json["user"].is_null());
        assert!(json["at"].as_str().unwrap().starts_with("1970-01-01T00:00:00"));
    }

    #[test]
    fn tracing_sink_does_not_panic() {
        TracingSink.record(&SecurityEvent::new(
            SecurityEventKind::KeyRotationCritical,
            "pointer unreadable",
            None,
            DateTime::from_timestamp_millis(0).unwrap(),
        ));
    }
}
