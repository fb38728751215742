//! Observable block attributes.
//!
//! Every attribute holds its current value as JSON together with a timestamp and an
//! alarm, published through a `tokio::sync::watch` channel. Subscribers see updates
//! for one attribute strictly in order; separate attributes are independent.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

/// Alarm severity, ordered from healthy to unusable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlarmSeverity {
    /// Value is healthy
    #[default]
    NoAlarm,
    /// Value is usable but suspicious
    Minor,
    /// Value is out of its operating range
    Major,
    /// Value cannot be trusted
    Invalid,
}

/// Alarm attached to an attribute value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    /// Severity of the alarm
    pub severity: AlarmSeverity,
    /// Short status code, e.g. "DEVICE" or "CONF"
    pub status: String,
    /// Human readable message
    pub message: String,
}

impl Alarm {
    /// No alarm.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Major alarm with a device status.
    pub fn major(message: impl Into<String>) -> Self {
        Self {
            severity: AlarmSeverity::Major,
            status: "DEVICE".into(),
            message: message.into(),
        }
    }

    /// Invalid alarm, used when a value is disconnected or unknown.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            severity: AlarmSeverity::Invalid,
            status: "UDF".into(),
            message: message.into(),
        }
    }
}

/// One published state of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeUpdate {
    /// Current value
    pub value: Value,
    /// When the value last changed
    pub timestamp: DateTime<Utc>,
    /// Alarm attached to the value
    pub alarm: Alarm,
}

/// Static description of an attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeMeta {
    /// Description shown to users
    pub description: String,
    /// Whether external callers may `put` to it
    pub writeable: bool,
    /// Free-form tags; `config` marks values saved in designs
    pub tags: Vec<String>,
}

/// Tag marking an attribute whose value is persisted in saved designs.
pub const CONFIG_TAG: &str = "config";

impl AttributeMeta {
    /// Read-only attribute with a description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    /// Allow external puts.
    pub fn writeable(mut self) -> Self {
        self.writeable = true;
        self
    }

    /// Add a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Writeable and saved in designs.
    pub fn config(self) -> Self {
        self.writeable().tag(CONFIG_TAG)
    }

    /// True when saved in designs.
    pub fn is_config(&self) -> bool {
        self.tags.iter().any(|t| t == CONFIG_TAG)
    }
}

/// A named, observable value on a block.
pub struct Attribute {
    name: String,
    meta: RwLock<AttributeMeta>,
    tx: watch::Sender<AttributeUpdate>,
}

impl Attribute {
    /// Create an attribute with an initial value.
    pub fn new(name: impl Into<String>, initial: Value, meta: AttributeMeta) -> Self {
        let (tx, _) = watch::channel(AttributeUpdate {
            value: initial,
            timestamp: Utc::now(),
            alarm: Alarm::ok(),
        });
        Self {
            name: name.into(),
            meta: RwLock::new(meta),
            tx,
        }
    }

    /// Attribute name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metadata snapshot
    pub fn meta(&self) -> AttributeMeta {
        self.meta.read().clone()
    }

    /// Change whether external callers may write the attribute.
    pub fn set_writeable(&self, writeable: bool) {
        self.meta.write().writeable = writeable;
    }

    /// Current value
    pub fn value(&self) -> Value {
        self.tx.borrow().value.clone()
    }

    /// Current value, timestamp and alarm
    pub fn update(&self) -> AttributeUpdate {
        self.tx.borrow().clone()
    }

    /// Subscribe to changes; the receiver starts at the current value.
    pub fn subscribe(&self) -> watch::Receiver<AttributeUpdate> {
        self.tx.subscribe()
    }

    /// Publish a new value, clearing any alarm.
    ///
    /// Subscribers are only woken when value or alarm actually change.
    pub fn set(&self, value: Value) {
        self.set_with_alarm(value, Alarm::ok());
    }

    /// Publish a new value with an alarm.
    pub fn set_with_alarm(&self, value: Value, alarm: Alarm) {
        self.tx.send_if_modified(|current| {
            if current.value == value && current.alarm == alarm {
                return false;
            }
            current.value = value;
            current.alarm = alarm;
            current.timestamp = Utc::now();
            true
        });
    }
}

impl std::fmt::Debug for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .field("value", &self.tx.borrow().value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unchanged_values_do_not_notify() {
        let attr = Attribute::new("counter", json!(0), AttributeMeta::new("frames"));
        let mut rx = attr.subscribe();
        rx.borrow_and_update();

        attr.set(json!(0));
        assert!(!rx.has_changed().unwrap());

        attr.set(json!(1));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().value, json!(1));
    }

    #[test]
    fn alarm_changes_are_published() {
        let attr = Attribute::new("health", json!("OK"), AttributeMeta::new("health"));
        attr.set_with_alarm(json!("OK"), Alarm::major("stalled"));
        assert_eq!(attr.update().alarm.severity, AlarmSeverity::Major);
    }

    #[test]
    fn config_meta_is_writeable_and_tagged() {
        let meta = AttributeMeta::new("exposure").config();
        assert!(meta.writeable);
        assert!(meta.is_config());
        assert!(!AttributeMeta::new("readback").is_config());
    }
}
