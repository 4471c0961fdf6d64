//! Adapter configuration and the named configuration store.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::beanstalk::Beanstalk;
use crate::adapter::memory::Memory;
use crate::adapter::Queue;
use crate::error::{QueueError, Result};
use crate::format::Format;
use crate::parser::is_valid_tube_name;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 11300;
pub const DEFAULT_TUBE: &str = "default";

/// Connection and behaviour settings for one beanstalkd adapter instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct BeanstalkConfig {
    pub host: String,
    pub port: u16,
    /// Seconds allowed for establishing the TCP connection.
    pub timeout: u64,
    /// Tube used for `put` and watched for `reserve`.
    pub tube: String,
    /// Bound passed to `kick` when the caller gives none.
    pub kick_bound: u64,
    /// Keep the connection open between producer calls.
    pub persistent: bool,
    /// Connect when the adapter is opened rather than on first use.
    pub auto_connect: bool,
    /// Look up each reserved job's stats to learn its priority and whether
    /// it's a redelivery. Costs one extra round trip per reservation.
    pub inspect_reserved: bool,
    /// Encoding of typed bodies.
    pub format: Format,
}

impl Default for BeanstalkConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            timeout: 60,
            tube: DEFAULT_TUBE.into(),
            kick_bound: 100,
            persistent: true,
            auto_connect: true,
            inspect_reserved: true,
            format: Format::Raw,
        }
    }
}

impl BeanstalkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_tube_name(self.tube.as_bytes()) {
            return Err(QueueError::InvalidTube(self.tube.clone()));
        }
        if self.host.is_empty() {
            return Err(QueueError::InvalidConfig("host is empty".into()));
        }
        if self.timeout == 0 {
            return Err(QueueError::InvalidConfig(
                "connect timeout must be at least one second".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for the in-process queue.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Label for logs. Memory queues have a single tube.
    pub tube: Option<String>,
    /// Largest body `write` accepts; larger ones are refused.
    pub max_job_size: Option<usize>,
    pub format: Format,
}

/// One named configuration, tagged by the backend it selects.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "adapter", rename_all = "lowercase")]
pub enum AdapterConfig {
    Beanstalk(BeanstalkConfig),
    Memory(MemoryConfig),
}

impl AdapterConfig {
    pub fn adapter_name(&self) -> &'static str {
        match self {
            Self::Beanstalk(_) => "beanstalk",
            Self::Memory(_) => "memory",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Beanstalk(config) => config.validate(),
            Self::Memory(_) => Ok(()),
        }
    }

    /// Constructs the adapter this configuration describes, connecting it
    /// straight away if it asks for that.
    pub async fn build(&self) -> Result<Arc<dyn Queue>> {
        self.validate()?;
        let queue: Arc<dyn Queue> = match self {
            Self::Beanstalk(config) => {
                Beanstalk::open(config.clone()).await? as Arc<dyn Queue>
            },
            Self::Memory(config) => {
                Memory::new(config.clone()) as Arc<dyn Queue>
            },
        };
        Ok(queue)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    configs: HashMap<String, AdapterConfig>,
}

/// Named configurations. Mutated only through `set`, `merge` and `remove`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigStore {
    configs: HashMap<String, AdapterConfig>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a YAML document of the form:
    ///
    /// ```yaml
    /// configs:
    ///   default:
    ///     adapter: beanstalk
    ///     host: 127.0.0.1
    ///     tube: emails
    /// ```
    pub fn from_yaml(input: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(input)
            .map_err(|e| QueueError::InvalidConfig(e.to_string()))?;

        let mut store = Self::new();
        store.merge(file.configs)?;
        Ok(store)
    }

    /// Registers `config` under `name`, replacing any previous entry.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        config: AdapterConfig,
    ) -> Result<()> {
        config.validate()?;
        self.configs.insert(name.into(), config);
        Ok(())
    }

    /// Registers every entry of `configs`. Nothing is registered unless all
    /// of them are valid.
    pub fn merge(
        &mut self,
        configs: impl IntoIterator<Item = (String, AdapterConfig)>,
    ) -> Result<()> {
        let configs: Vec<_> = configs.into_iter().collect();
        for (_, config) in &configs {
            config.validate()?;
        }
        self.configs.extend(configs);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<AdapterConfig> {
        self.configs.remove(name)
    }

    pub fn get(&self, name: &str) -> Result<&AdapterConfig> {
        self.configs
            .get(name)
            .ok_or_else(|| QueueError::Configuration(name.into()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }
}
