//! Lifecycle events emitted once per transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::InstanceId;
use super::state::ExecutionState;

/// One state transition of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub instance_id: InstanceId,
    /// Per-instance counter starting at 0
    pub sequence: u64,
    /// Absent for the CREATED event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<ExecutionState>,
    pub new_state: ExecutionState,
    pub timestamp: DateTime<Utc>,
    /// Transition details (`pid`, `exit_code`, `reason`)
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(
        instance_id: InstanceId,
        sequence: u64,
        previous_state: Option<ExecutionState>,
        new_state: ExecutionState,
        timestamp: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        Self {
            instance_id,
            sequence,
            previous_state,
            new_state,
            timestamp,
            payload,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.instance_id.job_id
    }

    pub fn is_terminal(&self) -> bool {
        self.new_state.is_terminal()
    }

    pub fn pid(&self) -> Option<u32> {
        self.payload
            .get("pid")
            .and_then(Value::as_u64)
            .and_then(|p| u32::try_from(p).ok())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.payload
            .get("exit_code")
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
    }

    pub fn reason(&self) -> Option<&str> {
        self.payload.get("reason").and_then(Value::as_str)
    }
}

/// Build a transition payload from the optional details
pub fn transition_payload(pid: Option<u32>, exit_code: Option<i32>, reason: Option<&str>) -> Value {
    let mut map = serde_json::Map::new();
    if let Some(pid) = pid {
        map.insert("pid".to_string(), pid.into());
    }
    if let Some(code) = exit_code {
        map.insert("exit_code".to_string(), code.into());
    }
    if let Some(reason) = reason {
        map.insert("reason".to_string(), reason.into());
    }
    if map.is_empty() {
        Value::Null
    } else {
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_event_has_no_previous_state() {
        let event = Event::new(
            InstanceId::new("job", "1-a"),
            0,
            None,
            ExecutionState::Created,
            Utc::now(),
            Value::Null,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("previous_state").is_none());
        assert_eq!(json["new_state"], "CREATED");
        assert_eq!(event.job_id(), "job");
    }

    #[test]
    fn test_payload_accessors() {
        let event = Event::new(
            InstanceId::new("job", "1-a"),
            3,
            Some(ExecutionState::Running),
            ExecutionState::Failed,
            Utc::now(),
            transition_payload(None, Some(2), Some("exit code 2")),
        );
        assert!(event.is_terminal());
        assert_eq!(event.exit_code(), Some(2));
        assert_eq!(event.reason(), Some("exit code 2"));
        assert_eq!(event.pid(), None);
    }

    #[test]
    fn test_empty_payload_is_null() {
        assert_eq!(transition_payload(None, None, None), Value::Null);
        assert_eq!(transition_payload(Some(42), None, None)["pid"], 42);
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = Event::new(
            InstanceId::new("job", "1-a"),
            2,
            Some(ExecutionState::Pending),
            ExecutionState::Running,
            Utc::now(),
            transition_payload(Some(99), None, None),
        );
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
