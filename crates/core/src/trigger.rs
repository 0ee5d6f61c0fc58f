//! Routing records: triggers, filters and delivery targets.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{MeshError, MeshResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExactFilter {
    #[serde(rename = "type")]
    pub event_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub exact: ExactFilter,
}

impl Filter {
    pub fn exact(event_type: impl Into<String>) -> Self {
        Self { exact: ExactFilter { event_type: event_type.into() } }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    Linear,
    Exponential,
}

/// Retry policy applied by the broker when a target rejects an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// ISO-8601 duration, e.g. `PT0.5S`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_policy: Option<BackoffPolicy>,
}

fn iso_duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^P(\d+D)?(T(\d+H)?(\d+M)?(\d+(\.\d+)?S)?)?$").expect("static regex")
    })
}

impl DeliveryOptions {
    pub fn is_empty(&self) -> bool {
        self == &DeliveryOptions::default()
    }

    pub fn validate(&self) -> MeshResult<()> {
        if let Some(delay) = self.backoff_delay.as_deref() {
            let well_formed = iso_duration_re().is_match(delay) && delay != "P" && !delay.ends_with('T');
            if !well_formed {
                return Err(MeshError::InvalidResource(format!(
                    "backoffDelay {:?} is not an ISO-8601 duration",
                    delay
                )));
            }
        }
        if self.backoff_policy.is_some() && self.backoff_delay.is_none() {
            return Err(MeshError::InvalidResource("backoffPolicy requires backoffDelay".into()));
        }
        Ok(())
    }
}

/// One delivery destination of a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub url: String,
    /// Name of the component resource behind `url`.
    #[serde(default, rename = "component", skip_serializing_if = "String::is_empty")]
    pub component_ref: String,
    #[serde(default, skip_serializing_if = "DeliveryOptions::is_empty")]
    pub delivery_options: DeliveryOptions,
}

impl Target {
    pub fn new(url: impl Into<String>, component_ref: impl Into<String>) -> Self {
        Self { url: url.into(), component_ref: component_ref.into(), delivery_options: DeliveryOptions::default() }
    }

    pub fn with_delivery(mut self, opts: DeliveryOptions) -> Self {
        self.delivery_options = opts;
        self
    }
}

/// A routing rule: events matching `filters` are delivered to every target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
    /// Empty means match-all; otherwise holds the single most recent filter.
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub filters: SmallVec<[Filter; 1]>,
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl Trigger {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), filters: SmallVec::new(), targets: Vec::new() }
    }

    /// Replace the filter (last write wins); `None` makes the trigger match every event.
    pub fn set_filter(&mut self, filter: Option<Filter>) {
        self.filters.clear();
        if let Some(f) = filter {
            self.filters.push(f);
        }
    }

    pub fn event_type(&self) -> Option<&str> {
        self.filters.first().map(|f| f.exact.event_type.as_str())
    }

    /// Append `target` unless a target with the same URL exists. Returns whether it was added.
    pub fn add_target(&mut self, target: Target) -> bool {
        if self.targets.iter().any(|t| t.url == target.url) {
            return false;
        }
        self.targets.push(target);
        true
    }

    /// Drop every target bound to `component`. Returns how many were removed.
    pub fn remove_targets_for(&mut self, component: &str) -> usize {
        let before = self.targets.len();
        self.targets.retain(|t| t.component_ref != component);
        before - self.targets.len()
    }

    pub fn targets_component(&self, component: &str) -> bool {
        self.targets.iter().any(|t| t.component_ref == component)
    }

    /// Dispatch decision: deliver iff the filter is empty or equals the event type exactly.
    pub fn matches(&self, event_type: &str) -> bool {
        match self.event_type() {
            None => true,
            Some(t) => t == event_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_is_last_write_wins() {
        let mut t = Trigger::new("tr");
        t.set_filter(Some(Filter::exact("a")));
        t.set_filter(Some(Filter::exact("b")));
        assert_eq!(t.filters.len(), 1);
        assert_eq!(t.event_type(), Some("b"));
        assert!(t.matches("b"));
        assert!(!t.matches("a"));
        t.set_filter(None);
        assert!(t.matches("anything"));
    }

    #[test]
    fn targets_dedup_by_url() {
        let mut t = Trigger::new("tr");
        assert!(t.add_target(Target::new("http://h:1", "a")));
        assert!(!t.add_target(Target::new("http://h:1", "other")));
        assert!(t.add_target(Target::new("http://h:2", "b")));
        assert_eq!(t.targets.len(), 2);
        assert_eq!(t.remove_targets_for("a"), 1);
        assert!(!t.targets_component("a"));
    }

    #[test]
    fn broker_config_yaml_shape() {
        let mut t = Trigger::new("local-trigger-foo");
        t.set_filter(Some(Filter::exact("foo")));
        t.add_target(Target::new("http://host.docker.internal:3000", "sink").with_delivery(DeliveryOptions {
            retries: Some(3),
            backoff_delay: Some("PT1S".into()),
            backoff_policy: Some(BackoffPolicy::Linear),
        }));
        let y = serde_yaml::to_string(&t).unwrap();
        assert!(y.contains("exact:"));
        assert!(y.contains("type: foo"));
        assert!(y.contains("component: sink"));
        assert!(y.contains("backoffPolicy: linear"));
        let back: Trigger = serde_yaml::from_str(&y).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn delivery_options_validation() {
        let ok = DeliveryOptions { retries: Some(1), backoff_delay: Some("PT0.2S".into()), backoff_policy: None };
        assert!(ok.validate().is_ok());
        let bad = DeliveryOptions { backoff_delay: Some("2s".into()), ..Default::default() };
        assert!(bad.validate().is_err());
        let dangling = DeliveryOptions { backoff_policy: Some(BackoffPolicy::Exponential), ..Default::default() };
        assert!(dangling.validate().is_err());
        assert!(DeliveryOptions { backoff_delay: Some("PT".into()), ..Default::default() }.validate().is_err());
    }
}
