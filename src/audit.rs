//! Append-only security audit trail.
//!
//! Recording never fails: a sink that cannot persist an event is reported
//! with a warning and the failure itself is recorded to the remaining sinks.

use crate::clock::Clock;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{info, warn};
use ulid::Ulid;

pub const AUDIT_TARGET: &str = "audit";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LoginSucceeded,
    LoginFailed,
    AccountLocked,
    OriginBlocked,
    OriginThrottled,
    HoneypotAccess,
    BruteForceDetected,
    AnomalyDetected,
    ChallengeIssued,
    ChallengeDeliveryFailed,
    ChallengeVerified,
    ChallengeFailed,
    SessionCreated,
    SessionExpired,
    SessionRevoked,
    SessionBindingViolation,
    PermissionDenied,
    UserCreated,
    RoleChanged,
    MfaChanged,
    PasswordChanged,
    PinChanged,
    TotpEnrolled,
    WebAuthnRegistered,
    PersistenceFailure,
    AuditSinkFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
    Info,
}

pub type AuditDetail = BTreeMap<String, String>;

/// Build a detail map from literal pairs.
#[must_use]
pub fn detail<const N: usize>(pairs: [(&str, String); N]) -> AuditDetail {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Ulid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub detail: AuditDetail,
}

pub trait AuditSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Persist one event.
    ///
    /// # Errors
    /// Returns an error if the event did not reach the sink.
    fn append(&self, event: &AuditEvent) -> Result<()>;
}

/// Emits every event as a structured `tracing` event on the `audit` target.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn append(&self, event: &AuditEvent) -> Result<()> {
        let detail = serde_json::to_string(&event.detail).context("Failed to encode detail")?;
        info!(
            target: AUDIT_TARGET,
            id = %event.id,
            event_type = ?event.event_type,
            actor = %event.actor,
            outcome = ?event.outcome,
            detail = %detail,
            "audit"
        );
        Ok(())
    }
}

/// One JSON document per line, appended and flushed per event.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesAuditSink {
    /// Open (or create) the log file for appending.
    ///
    /// # Errors
    /// Returns an error if the file or its directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log: {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn name(&self) -> &'static str {
        "json_lines"
    }

    fn append(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("Failed to encode audit event")?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)
            .and_then(|()| file.flush())
            .with_context(|| format!("Failed to append to {}", self.path.display()))
    }
}

/// In-memory sink for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn append(&self, event: &AuditEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
    clock: Arc<dyn Clock>,
    sink_failures: AtomicU64,
}

impl AuditLog {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sinks,
            clock,
            sink_failures: AtomicU64::new(0),
        }
    }

    /// Append an event to every sink.
    pub fn record(
        &self,
        event_type: AuditEventType,
        actor: &str,
        outcome: AuditOutcome,
        detail: AuditDetail,
    ) -> AuditEvent {
        let event = AuditEvent {
            id: Ulid::new(),
            timestamp: self.clock.now(),
            event_type,
            actor: actor.to_string(),
            outcome,
            detail,
        };

        let failed: Vec<(usize, String)> = self
            .sinks
            .iter()
            .enumerate()
            .filter_map(|(index, sink)| {
                sink.append(&event)
                    .err()
                    .map(|e| (index, format!("{e:#}")))
            })
            .collect();

        for (index, error) in failed {
            self.sink_failures.fetch_add(1, Ordering::Relaxed);
            let sink_name = self.sinks[index].name();
            warn!(sink = sink_name, event_id = %event.id, "Failed to record audit event: {error}");
            self.report_sink_failure(index, sink_name, &event, error);
        }

        event
    }

    fn report_sink_failure(&self, failed: usize, sink_name: &str, lost: &AuditEvent, error: String) {
        let notice = AuditEvent {
            id: Ulid::new(),
            timestamp: self.clock.now(),
            event_type: AuditEventType::AuditSinkFailure,
            actor: "system".to_string(),
            outcome: AuditOutcome::Failure,
            detail: detail([
                ("sink", sink_name.to_string()),
                ("lost_event", lost.id.to_string()),
                ("error", error),
            ]),
        };
        for (index, sink) in self.sinks.iter().enumerate() {
            if index == failed {
                continue;
            }
            if let Err(e) = sink.append(&notice) {
                warn!(sink = sink.name(), "Failed to record audit sink failure: {e:#}");
            }
        }
    }

    /// How many sink writes have failed since start.
    #[must_use]
    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }
}
