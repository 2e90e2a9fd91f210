//! Target-endpoint mapping from event type to delivery URL.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{EventType, TargetEndpoint};

/// Static routing table resolved once per accepted event.
///
/// An exact event-type match wins; otherwise `default` applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteTable {
    #[serde(default)]
    pub default: Option<TargetEndpoint>,
    #[serde(default)]
    pub by_type: BTreeMap<String, TargetEndpoint>,
}

impl RouteTable {
    /// A table that sends every event type to `target`.
    pub fn single(target: TargetEndpoint) -> Self {
        Self {
            default: Some(target),
            by_type: BTreeMap::new(),
        }
    }

    /// Adds or replaces the route for `event_type`.
    pub fn with_route(mut self, event_type: impl Into<String>, target: TargetEndpoint) -> Self {
        self.by_type.insert(event_type.into(), target);
        self
    }

    /// Returns the target for `event_type`, falling back to the default route.
    pub fn resolve(&self, event_type: &EventType) -> Option<&TargetEndpoint> {
        self.by_type
            .get(event_type.as_str())
            .or(self.default.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_type.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str) -> TargetEndpoint {
        TargetEndpoint::new(url).unwrap()
    }

    #[test]
    fn exact_type_beats_default() {
        let table = RouteTable::single(target("http://default/hook"))
            .with_route("message", target("http://messages/hook"));

        let message = EventType::new("message").unwrap();
        let other = EventType::new("other").unwrap();
        assert_eq!(table.resolve(&message).unwrap().as_str(), "http://messages/hook");
        assert_eq!(table.resolve(&other).unwrap().as_str(), "http://default/hook");
    }

    #[test]
    fn no_default_means_unroutable() {
        let table = RouteTable::default().with_route("message", target("http://messages/hook"));
        assert!(table.resolve(&EventType::new("other").unwrap()).is_none());
        assert!(!table.is_empty());
        assert!(RouteTable::default().is_empty());
    }
}
