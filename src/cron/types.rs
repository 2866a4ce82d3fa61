//! Core data types for scheduled jobs

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a job is scheduled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronSchedule {
    /// One-shot: fire once at `at_ms` (epoch millis)
    #[serde(rename_all = "camelCase")]
    At { at_ms: u64 },
    /// Fixed interval, optionally anchored
    #[serde(rename_all = "camelCase")]
    Every {
        every_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<u64>,
    },
    /// Cron expression (5-field standard, or 6/7-field with seconds), UTC
    Cron { expr: String },
}

/// Outcome of a single job run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Ok,
    Error,
    Skipped,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

/// Mutable runtime state of a job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<u64>,
}

/// A scheduled job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: CronSchedule,
    /// Opaque to the scheduler; handed to the executor
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub state: CronJobState,
    pub created_at_ms: u64,
}

/// Input for creating a job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronJobCreate {
    pub name: String,
    pub schedule: CronSchedule,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

const fn default_true() -> bool {
    true
}

impl CronJobCreate {
    #[must_use]
    pub fn new(name: impl Into<String>, schedule: CronSchedule) -> Self {
        Self {
            name: name.into(),
            schedule,
            payload: Value::Null,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn schedule_wire_shape() {
        let every = CronSchedule::Every {
            every_ms: 1000,
            anchor_ms: None,
        };
        assert_eq!(
            serde_json::to_value(&every).unwrap(),
            json!({"kind": "every", "everyMs": 1000})
        );

        let parsed: CronSchedule =
            serde_json::from_value(json!({"kind": "cron", "expr": "*/5 * * * *"})).unwrap();
        assert_eq!(
            parsed,
            CronSchedule::Cron {
                expr: "*/5 * * * *".into()
            }
        );
    }

    #[test]
    fn create_defaults_to_enabled() {
        let create: CronJobCreate = serde_json::from_value(json!({
            "name": "daily",
            "schedule": {"kind": "at", "atMs": 5}
        }))
        .unwrap();
        assert!(create.enabled);
        assert!(create.payload.is_null());
    }
}
