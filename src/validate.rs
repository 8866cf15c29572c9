//! Required-field checks for candidate records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What counts as a "missing" required field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    /// Absent, `null`, or the empty string.
    #[default]
    Absent,
    /// Everything `Absent` rejects plus `false` and numeric zero.
    Falsy,
}

impl MissingPolicy {
    pub fn is_missing(self, value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Bool(b)) => self == MissingPolicy::Falsy && !b,
            Some(Value::Number(n)) => {
                self == MissingPolicy::Falsy && n.as_f64().is_some_and(|f| f == 0.0)
            }
            Some(Value::Array(_)) | Some(Value::Object(_)) => false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecordValidator {
    required: Vec<String>,
    policy: MissingPolicy,
}

impl RecordValidator {
    pub fn new<I, S>(required: I, policy: MissingPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            policy,
        }
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn policy(&self) -> MissingPolicy {
        self.policy
    }

    pub fn is_valid(&self, record: &Value) -> bool {
        record.is_object() && self.first_missing(record).is_none()
    }

    /// First required field (in configured order) the record lacks.
    /// Non-object records report their first required field.
    pub fn first_missing(&self, record: &Value) -> Option<&str> {
        let obj = record.as_object();
        self.required
            .iter()
            .find(|field| {
                self.policy
                    .is_missing(obj.and_then(|o| o.get(field.as_str())))
            })
            .map(String::as_str)
    }

    /// Reason string for a failing record, `None` when it passes.
    pub fn check(&self, record: &Value) -> Option<String> {
        if !record.is_object() {
            return Some("record is not an object".to_string());
        }
        self.first_missing(record)
            .map(|field| format!("missing required field `{field}`"))
    }
}
