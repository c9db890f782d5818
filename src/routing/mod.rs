//! Topic routing table
//!
//! Maps each origin topic to exactly one destination topic. The table is
//! built once from configuration, validated fail-fast, and read-only for the
//! process lifetime, so every inbound delivery can consult it concurrently
//! without synchronization.

use std::collections::HashMap;

use crate::config::ConfigError;


/// An ordered (origin, destination) topic pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Topic the bridge subscribes on
    pub origin: String,
    /// Topic the payload is re-published to
    pub destination: String,
}

impl Route {
    pub fn new(origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
        }
    }
}

/// Immutable origin-topic -> destination-topic lookup.
#[derive(Debug)]
pub struct RoutingTable {
    /// Lookup keyed by (possibly normalized) origin topic
    table: HashMap<String, String>,
    /// Origins in configuration order, as configured (un-normalized)
    origins: Vec<String>,
    /// Whether origins were lowercased at build time
    case_insensitive: bool,
}

impl RoutingTable {
    /// Build a table from an ordered sequence of routes.
    ///
    /// Fails if any topic name is invalid for exact-match routing or if two
    /// routes share an origin: the table must be a function, not a relation.
    pub fn build(routes: &[Route], case_insensitive: bool) -> Result<Self, ConfigError> {
        let mut table = HashMap::with_capacity(routes.len());
        let mut origins = Vec::with_capacity(routes.len());

        for route in routes {
            validate_topic_name(&route.origin)?;
            validate_topic_name(&route.destination)?;

            let key = if case_insensitive {
                route.origin.to_ascii_lowercase()
            } else {
                route.origin.clone()
            };

            if table.contains_key(&key) {
                return Err(ConfigError::Validation(format!(
                    "duplicate route origin topic '{}'",
                    route.origin
                )));
            }

            table.insert(key, route.destination.clone());
            origins.push(route.origin.clone());
        }

        if table.is_empty() {
            return Err(ConfigError::Validation("no routes configured".to_string()));
        }

        Ok(Self {
            table,
            origins,
            case_insensitive,
        })
    }

    /// Resolve the destination for an inbound topic.
    ///
    /// Pure lookup, no side effects. `None` means the message is unroutable,
    /// which is an expected outcome rather than an error.
    pub fn resolve(&self, topic: &str) -> Option<&str> {
        if self.case_insensitive {
            self.table
                .get(&topic.to_ascii_lowercase())
                .map(String::as_str)
        } else {
            self.table.get(topic).map(String::as_str)
        }
    }

    /// The subscription set: all route origins, in configuration order.
    pub fn origins(&self) -> impl Iterator<Item = &str> {
        self.origins.iter().map(String::as_str)
    }

    /// Number of routes in the table.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Validate a topic name for exact-match routing.
///
/// The bridge routes on topic identity, so filter wildcards are rejected
/// rather than silently treated as literals.
fn validate_topic_name(topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(ConfigError::Validation("empty topic name".to_string()));
    }
    if topic.len() > 65535 {
        let head: String = topic.chars().take(32).collect();
        return Err(ConfigError::Validation(format!(
            "topic name exceeds 65535 bytes: '{}...'",
            head
        )));
    }
    if topic.contains(['+', '#']) {
        return Err(ConfigError::Validation(format!(
            "topic name '{}' contains a wildcard; routes use exact topic names",
            topic
        )));
    }
    if topic.contains('\0') {
        return Err(ConfigError::Validation(format!(
            "topic name '{}' contains a null character",
            topic.escape_debug()
        )));
    }
    Ok(())
}
