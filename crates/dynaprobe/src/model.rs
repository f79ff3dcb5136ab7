use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Declarative description of one check, as loaded from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDefinition {
    /// Unique identifier of the check
    pub id: String,

    /// Human-readable title
    pub name: String,

    /// Group (team, service owner) the check belongs to
    #[serde(default)]
    pub group: String,

    /// Tag selecting the check variant, e.g. `ssh` or `ldap`
    #[serde(rename = "type")]
    pub check_type: String,

    /// Weight of this check when results are scored downstream
    #[serde(default = "default_score_weight")]
    pub score_weight: f64,

    /// Values substituted into the definition template
    #[serde(default, alias = "attribs")]
    pub attributes: HashMap<String, String>,

    /// Templated definition payload, usually a JSON object
    #[serde(deserialize_with = "raw_definition")]
    pub definition: String,
}

fn default_score_weight() -> f64 {
    1.0
}

/// Accept the payload either as template text or as an inline JSON object
fn raw_definition<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => Ok(text),
        other => Ok(other.to_string()),
    }
}

impl CheckDefinition {
    /// Identity fields handed to a check on initialization
    pub fn meta(&self) -> CheckMeta {
        CheckMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            group: self.group.clone(),
            score_weight: self.score_weight,
        }
    }
}

/// Identity shared by every check variant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckMeta {
    pub id: String,
    pub name: String,
    pub group: String,
    pub score_weight: f64,
}

/// Outcome of a single check run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    /// The pass deadline expired before the check reported
    TimedOut,
    /// The definition could not be turned into a runnable check
    Invalid,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Passed => write!(f, "passed"),
            CheckStatus::Failed => write!(f, "failed"),
            CheckStatus::TimedOut => write!(f, "timed_out"),
            CheckStatus::Invalid => write!(f, "invalid"),
        }
    }
}

/// Result of a check, exactly one per check per pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// When the check started running
    pub timestamp: DateTime<Utc>,

    pub id: String,
    pub name: String,
    pub group: String,
    pub score_weight: f64,

    /// Variant tag of the check that produced this result
    pub check_type: String,

    pub status: CheckStatus,

    /// Human-readable explanation of the outcome
    pub message: String,

    /// Optional structured payload for downstream consumers
    pub details: Option<serde_json::Value>,
}

impl CheckResult {
    /// Create a pending result stamped with the check identity.
    ///
    /// The status starts as `Failed` so that an early return never reports a pass.
    pub fn new(meta: &CheckMeta, check_type: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            id: meta.id.clone(),
            name: meta.name.clone(),
            group: meta.group.clone(),
            score_weight: meta.score_weight,
            check_type: check_type.to_string(),
            status: CheckStatus::Failed,
            message: String::new(),
            details: None,
        }
    }

    /// Whether the check passed
    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Passed
    }

    /// Mark the check as successful
    pub fn success(mut self, message: impl Into<String>) -> Self {
        self.status = CheckStatus::Passed;
        self.message = message.into();
        self
    }

    /// Mark the check as failed with error
    pub fn failure(mut self, message: impl Into<String>) -> Self {
        self.status = CheckStatus::Failed;
        self.message = message.into();
        self
    }

    /// Mark the check as cut off by the pass deadline
    pub fn timed_out(mut self, message: impl Into<String>) -> Self {
        self.status = CheckStatus::TimedOut;
        self.message = message.into();
        self
    }

    /// Mark the check as never started because its definition was unusable
    pub fn invalid(mut self, message: impl Into<String>) -> Self {
        self.status = CheckStatus::Invalid;
        self.message = message.into();
        self
    }

    /// Attach a structured payload
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Normalized outbound event handed to the publication sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckEvent {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: String,
    pub name: String,
    pub group: String,
    pub score_weight: f64,
    pub check_type: String,
    pub passed: bool,
    pub status: CheckStatus,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl CheckEvent {
    /// Translate a result 1:1 into an event
    pub fn from_result(event_type: &str, result: CheckResult) -> Self {
        Self {
            timestamp: result.timestamp,
            event_type: event_type.to_string(),
            passed: result.passed(),
            id: result.id,
            name: result.name,
            group: result.group,
            score_weight: result.score_weight,
            check_type: result.check_type,
            status: result.status,
            message: result.message,
            details: result.details,
        }
    }
}
