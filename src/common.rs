//! Identifiers and the per-run context shared by all the components.

use std::{str::FromStr, time::Duration};

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(
    Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display, From, Into, Serialize, Deserialize,
)]
/// A stable participant identifier.
///
/// Participant identifiers are totally ordered: the coordinator sums local updates in ascending
/// identifier order to keep the aggregated model reproducible.
pub struct ParticipantId(u64);

impl ParticipantId {
    /// Creates a participant identifier.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

#[derive(
    Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display, From, Into, Serialize, Deserialize,
)]
/// The rank of a process in a fixed-size process group.
pub struct Rank(u32);

impl Rank {
    /// The rank of the coordinator.
    pub const COORDINATOR: Rank = Rank(0);

    /// Creates a rank.
    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }
}

#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Display, Serialize, Deserialize)]
/// A unique random run identifier
pub struct RunId(Uuid);

impl RunId {
    /// Return a new random run identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// The device on which participants run their local training.
pub enum Device {
    #[display(fmt = "cpu")]
    Cpu,
    #[display(fmt = "gpu:{}", _0)]
    Gpu(u32),
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

#[derive(Debug, Error)]
#[error("invalid device `{0}`, expected `cpu` or `gpu:<index>`")]
pub struct InvalidDevice(String);

impl FromStr for Device {
    type Err = InvalidDevice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "cpu" => Ok(Device::Cpu),
            "gpu" => Ok(Device::Gpu(0)),
            other => other
                .strip_prefix("gpu:")
                .and_then(|index| index.parse().ok())
                .map(Device::Gpu)
                .ok_or_else(|| InvalidDevice(s.to_string())),
        }
    }
}

/// Everything that is scoped to a single FedAVG run.
///
/// A context is created before the run starts and handed to the orchestrator; nothing in it is
/// global or shared between runs.
#[derive(Clone, Debug)]
pub struct RunContext {
    /// Identifies the run in logs.
    pub run_id: RunId,
    /// The device handed to the local trainers.
    pub device: Device,
    /// Aborts the whole run once elapsed, if set.
    pub deadline: Option<Duration>,
}

impl RunContext {
    /// Creates a context for a new run on the given device, without deadline.
    pub fn new(device: Device) -> Self {
        Self {
            run_id: RunId::new(),
            device,
            deadline: None,
        }
    }

    /// Sets the run deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Device::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_ids_are_ordered() {
        let mut ids = vec![ParticipantId::new(3), ParticipantId::new(1), ParticipantId::new(2)];
        ids.sort();
        assert_eq!(
            ids,
            vec![ParticipantId::new(1), ParticipantId::new(2), ParticipantId::new(3)]
        );
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Gpu(1).to_string(), "gpu:1");
    }

    #[test]
    fn test_parse_device() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("gpu".parse::<Device>().unwrap(), Device::Gpu(0));
        assert_eq!("gpu:3".parse::<Device>().unwrap(), Device::Gpu(3));
        assert!("gpu:x".parse::<Device>().is_err());
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
