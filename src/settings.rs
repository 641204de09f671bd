//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables prefixed
//! with `FEDAVG`, nested keys being separated by `__`. An example configuration file can be found
//! in the `configs/` directory located in the repository root.

use std::{fmt, net::SocketAddr, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
    Serialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    common::{Device, ParticipantId, Rank},
    model::{ModelError, ParameterSet, Tensor},
    transport::{GroupError, RankMap},
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub federation: FederationSettings,
    #[validate]
    pub group: GroupSettings,
    #[validate]
    pub model: ModelSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: PathBuf) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path))?;
        config.merge(Environment::with_prefix("fedavg").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_federation"))]
/// Settings of the FedAVG run.
pub struct FederationSettings {
    /// The number of rounds to run. A run with `0` rounds returns the initial model.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// num_rounds = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_FEDERATION__NUM_ROUNDS=10
    /// ```
    pub num_rounds: u64,

    #[validate(range(min = 1))]
    /// The number of local training passes per round. The value must be greater or equal to `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// epochs = 1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_FEDERATION__EPOCHS=1
    /// ```
    pub epochs: u32,

    #[validate(range(min = 1))]
    /// The time granted to the participants for their local updates, in seconds. Participants
    /// that don't answer within that time are considered missing and fail the round.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// collect_timeout = 600
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_FEDERATION__COLLECT_TIMEOUT=600
    /// ```
    pub collect_timeout: u64,

    /// The time after which the whole run is aborted, in seconds. No deadline if unset.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// run_deadline = 86400
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_FEDERATION__RUN_DEADLINE=86400
    /// ```
    #[serde(default)]
    pub run_deadline: Option<u64>,

    /// The device of the local training, either `cpu` or `gpu:<index>`. Defaults to `cpu`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// device = "gpu:0"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_FEDERATION__DEVICE=gpu:0
    /// ```
    #[serde(default, deserialize_with = "deserialize_device")]
    pub device: Device,
}

impl FederationSettings {
    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline.map(Duration::from_secs)
    }
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self {
            num_rounds: 1,
            epochs: 1,
            collect_timeout: 600,
            run_deadline: None,
            device: Device::Cpu,
        }
    }
}

/// Checks the validity of the federation settings.
fn validate_federation(s: &FederationSettings) -> Result<(), ValidationError> {
    match s.run_deadline {
        Some(deadline) if deadline < s.collect_timeout => Err(ValidationError::new(
            "run deadline must not be shorter than the collect timeout",
        )),
        _ => Ok(()),
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Settings of the process group of the distributed mode.
pub struct GroupSettings {
    /// The address the coordinator listens on and the participants connect to.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [group]
    /// coordinator_address = "127.0.0.1:8090"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_GROUP__COORDINATOR_ADDRESS=127.0.0.1:8090
    /// ```
    pub coordinator_address: SocketAddr,

    #[validate(range(min = 1))]
    /// The time granted to all participants to join the group, in seconds.
    pub connect_timeout: u64,

    #[validate(range(min = 1))]
    /// The time the coordinator waits for a single message of a participant, in seconds.
    pub receive_timeout: u64,

    #[validate(range(min = 1024))]
    /// The maximal length of a frame on the wire, in bytes. Must fit a whole encoded model.
    pub max_frame_length: usize,

    #[validate(length(min = 1))]
    /// The participant ranks. Rank `0` is the coordinator and is not listed.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [[group.ranks]]
    /// rank = 1
    /// participant = 11
    ///
    /// [[group.ranks]]
    /// rank = 2
    /// participant = 12
    /// ```
    pub ranks: Vec<RankSettings>,
}

impl GroupSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout)
    }

    /// Builds the rank map of the group.
    pub fn rank_map(&self) -> Result<RankMap, GroupError> {
        RankMap::new(
            self.ranks
                .iter()
                .map(|r| (Rank::new(r.rank), ParticipantId::new(r.participant))),
        )
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
/// The participant running at a rank.
pub struct RankSettings {
    pub rank: u32,
    pub participant: u64,
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Model settings.
pub struct ModelSettings {
    #[validate(length(min = 1))]
    /// The tensors of the model, in order. The initial global model is all zeros.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [[model.tensors]]
    /// name = "dense.weight"
    /// shape = [4, 2]
    /// ```
    pub tensors: Vec<TensorSettings>,
}

impl ModelSettings {
    /// Builds the initial global model.
    pub fn initial_params(&self) -> Result<ParameterSet, ModelError> {
        ParameterSet::new(
            self.tensors
                .iter()
                .map(|tensor| Tensor::zeros(tensor.name.as_str(), &tensor.shape))
                .collect(),
        )
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TensorSettings {
    pub name: String,
    pub shape: Vec<usize>,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.17/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.17/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

// config-rs hands every environment variable over as a string, so the device is parsed from its
// string form in both sources.
fn deserialize_device<'de, D>(deserializer: D) -> Result<Device, D::Error>
where
    D: Deserializer<'de>,
{
    struct DeviceVisitor;

    impl<'de> Visitor<'de> for DeviceVisitor {
        type Value = Device;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("`cpu` or `gpu:<index>`")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value.parse().map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_str(DeviceVisitor)
}
