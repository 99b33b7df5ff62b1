// ── Entity identity ──
//
// Every entity on the hub is addressed as `<domain>.<object_id>`. The id is
// kept as the exact string the hub sent; the split is computed on demand.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical identifier of a hub entity, e.g. `light.kitchen`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Category prefix before the first dot. `None` when the id has no dot.
    pub fn domain(&self) -> Option<&str> {
        self.0.split_once('.').map(|(domain, _)| domain)
    }

    /// Everything after the first dot, or the whole id when there is none.
    pub fn object_id(&self) -> &str {
        self.0
            .split_once('.')
            .map_or(self.0.as_str(), |(_, object_id)| object_id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_at_first_dot() {
        let id = EntityId::from("sensor.outdoor.temperature");
        assert_eq!(id.domain(), Some("sensor"));
        assert_eq!(id.object_id(), "outdoor.temperature");
    }

    #[test]
    fn id_without_domain() {
        let id = EntityId::from("sun");
        assert_eq!(id.domain(), None);
        assert_eq!(id.object_id(), "sun");
        assert_eq!(id.to_string(), "sun");
    }
}
