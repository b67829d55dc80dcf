use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// States a deployment can be in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Accepted and waiting for a worker
    #[default]
    Queued,

    /// A worker is producing and starting the container
    Building,

    /// The container is running and port-mapped
    Active,

    /// The container exists but is not running
    Stopped,

    /// The rollout failed; see the log bus for the reason
    Failed,
}

impl Status {
    /// States whose logs come from the log bus rather than the container.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Status::Queued | Status::Building)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::Status;

    #[test]
    fn status_round_trip() {
        assert_eq!(Status::Building, Status::from_str("builDing").unwrap());
        assert_eq!(Status::Queued, Status::from_str("queued").unwrap());
        assert_eq!("active", Status::Active.to_string());
        assert!(Status::Building.is_in_flight());
        assert!(!Status::Failed.is_in_flight());
    }
}
