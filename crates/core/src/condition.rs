//! Status conditions and the set-if-changed tracker.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Condition type: the trait's last reconcile against its target.
pub const TYPE_SYNCED: &str = "Synced";

pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub ty: String,
    pub status: ConditionStatus,
    #[serde(with = "rfc3339")]
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(ty: impl Into<String>, status: ConditionStatus, reason: impl Into<String>) -> Self {
        Self { ty: ty.into(), status, last_transition_time: Utc::now(), reason: reason.into(), message: None }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// The last reconcile succeeded.
    pub fn reconcile_success() -> Self {
        Self::new(TYPE_SYNCED, ConditionStatus::True, REASON_RECONCILE_SUCCESS)
    }

    /// The last reconcile failed; the message is the full error chain.
    pub fn reconcile_error(err: &anyhow::Error) -> Self {
        Self::new(TYPE_SYNCED, ConditionStatus::False, REASON_RECONCILE_ERROR).with_message(format!("{:#}", err))
    }

    /// Placeholder for a type that has never been set.
    pub fn unknown(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            status: ConditionStatus::Unknown,
            last_transition_time: DateTime::<Utc>::default(),
            reason: String::new(),
            message: None,
        }
    }

    /// Equality over type, status, reason and message. The transition time is ignored.
    pub fn equal(&self, other: &Condition) -> bool {
        self.ty == other.ty && self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Ordered set of conditions, at most one per type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionedStatus {
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub conditions: SmallVec<[Condition; 2]>,
}

impl ConditionedStatus {
    pub fn get_condition(&self, ty: &str) -> Condition {
        self.conditions.iter().find(|c| c.ty == ty).cloned().unwrap_or_else(|| Condition::unknown(ty))
    }

    /// Set the supplied conditions, replacing any existing condition of the same type.
    /// A condition equal to the existing one (ignoring transition time) is left untouched.
    /// Returns true if the set changed.
    pub fn set_conditions(&mut self, cs: impl IntoIterator<Item = Condition>) -> bool {
        let mut changed = false;
        for c in cs {
            match self.conditions.iter_mut().find(|existing| existing.ty == c.ty) {
                Some(existing) if existing.equal(&c) => {}
                Some(existing) => {
                    *existing = c;
                    changed = true;
                }
                None => {
                    self.conditions.push(c);
                    changed = true;
                }
            }
        }
        changed
    }
}

mod rfc3339 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw).map(|dt| dt.with_timezone(&Utc)).map_err(serde::de::Error::custom)
    }
}
