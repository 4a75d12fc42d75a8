//! Serializable identifiers and scheduling primitives.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a bot, as issued by the bot records collaborator.
pub type BotId = String;

/// Identifier of a slot record.
pub type SlotId = uuid::Uuid;

/// Queue priority on a 0-100 scale. Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Served before everything else.
    pub const HIGHEST: Self = Self(0);
    /// Mid-range default.
    pub const DEFAULT: Self = Self(50);
    /// Served last.
    pub const LOWEST: Self = Self(100);

    /// Build a priority, clamping values above [`Priority::LOWEST`].
    pub fn new(value: u8) -> Self {
        Self(value.min(Self::LOWEST.0))
    }

    /// Raw priority value.
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of execution backend a slot lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Self-hosted PaaS reached over HTTP.
    Paas,
    /// Cloud container-task service.
    ContainerTask,
    /// Cluster orchestrator.
    Cluster,
    /// Local process, for development.
    Local,
}

impl BackendKind {
    /// All kinds in their default priority order.
    pub const ALL: [Self; 4] = [Self::Paas, Self::ContainerTask, Self::Cluster, Self::Local];

    /// Stable configuration name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Paas => "paas",
            Self::ContainerTask => "container_task",
            Self::Cluster => "cluster",
            Self::Local => "local",
        }
    }

    /// Prefix used in human-readable slot names, e.g. `container-task-slot-3`.
    pub const fn platform_label(self) -> &'static str {
        match self {
            Self::Paas => "paas",
            Self::ContainerTask => "container-task",
            Self::Cluster => "cluster",
            Self::Local => "local",
        }
    }

    /// Name of the advisory lock guarding this backend's slot pool.
    pub fn pool_lock_key(self) -> String {
        format!("slot-pool:{}", self.as_str())
    }

    /// Name of the advisory lock serializing inventory changes (recreate, reconcile).
    pub fn inventory_lock_key(self) -> String {
        format!("slot-inventory:{}", self.as_str())
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown backend `{s}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_clamps() {
        assert_eq!(Priority::new(250), Priority::LOWEST);
        assert!(Priority::new(1) < Priority::new(5));
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("container-task".parse::<BackendKind>(), Ok(BackendKind::ContainerTask));
        assert_eq!("LOCAL".parse::<BackendKind>(), Ok(BackendKind::Local));
        assert!("mainframe".parse::<BackendKind>().is_err());
    }
}
