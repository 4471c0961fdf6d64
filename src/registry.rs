//! Named queues: resolves a configuration name to a shared adapter, and runs
//! filters over the legacy `add`/`run`/`reset` calls before they reach it.
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::adapter::{
    AddOptions, Queue, ResetOptions, RunOptions, WriteOptions,
};
use crate::config::{AdapterConfig, ConfigStore};
use crate::error::Result;

pub const DEFAULT_CONFIG: &str = "default";

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    Add,
    Run,
    Reset,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallOptions {
    /// Name of the configuration whose adapter handles the call.
    pub config: String,
    /// `add` only.
    pub payload: Option<Bytes>,
    /// Reservation wait for `run` and `reset`.
    pub timeout: Option<u32>,
    pub tube: Option<String>,
    /// `add` only.
    pub write: WriteOptions,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            config: DEFAULT_CONFIG.into(),
            payload: None,
            timeout: None,
            tube: None,
            write: WriteOptions::default(),
        }
    }
}

impl CallOptions {
    pub fn config(name: impl Into<String>) -> Self {
        Self {
            config: name.into(),
            ..Default::default()
        }
    }
}

/// A call on its way through the filter chain.
#[derive(Clone, Debug)]
pub struct Call {
    pub operation: Operation,
    /// Set for `add`.
    pub task: Option<String>,
    pub options: CallOptions,
}

/// Inspects, rewrites, or (by returning an error) refuses a call.
pub type Filter = Arc<dyn Fn(&mut Call) -> Result<()> + Send + Sync>;

pub struct Registry {
    store: ConfigStore,
    instances: Mutex<HashMap<String, Arc<dyn Queue>>>,
    filters: HashMap<Operation, Vec<Filter>>,
}

impl Registry {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            instances: Default::default(),
            filters: Default::default(),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Registers or replaces a configuration. A cached adapter for `name` is
    /// dropped so the next call builds one from the new settings.
    pub fn configure(
        &mut self,
        name: impl Into<String>,
        config: AdapterConfig,
    ) -> Result<()> {
        let name = name.into();
        self.store.set(name.clone(), config)?;
        self.instances.get_mut().remove(&name);
        Ok(())
    }

    /// Appends a filter to those run before every `operation` call, in order
    /// of registration.
    pub fn filter<F>(&mut self, operation: Operation, filter: F)
    where
        F: Fn(&mut Call) -> Result<()> + Send + Sync + 'static,
    {
        self.filters
            .entry(operation)
            .or_default()
            .push(Arc::new(filter));
    }

    /// The adapter for configuration `name`, built on first use and shared
    /// afterwards.
    pub async fn adapter(&self, name: &str) -> Result<Arc<dyn Queue>> {
        let mut instances = self.instances.lock().await;
        if let Some(queue) = instances.get(name) {
            return Ok(queue.clone());
        }

        let config = self.store.get(name)?;
        let queue = config.build().await?;
        info!(name, adapter = config.adapter_name(), "created adapter");

        instances.insert(name.to_owned(), queue.clone());
        Ok(queue)
    }

    fn apply_filters(&self, call: &mut Call) -> Result<()> {
        for filter in self.filters.get(&call.operation).into_iter().flatten() {
            filter(call)?;
        }
        debug!(
            operation = ?call.operation,
            config = %call.options.config,
            "filters passed"
        );
        Ok(())
    }

    /// Queues `task` (with `options.payload` appended) on the configured
    /// adapter.
    pub async fn add(&self, task: &str, options: CallOptions) -> Result<bool> {
        let mut call = Call {
            operation: Operation::Add,
            task: Some(task.to_owned()),
            options,
        };
        self.apply_filters(&mut call)?;

        let queue = self.adapter(&call.options.config).await?;
        let task = call.task.unwrap_or_default();
        let add = AddOptions {
            payload: call.options.payload,
            tube: call.options.tube,
            write: call.options.write,
        };
        queue.add(&task, add).await
    }

    /// Takes one job off the configured adapter and returns its body.
    pub async fn run(&self, options: CallOptions) -> Result<Option<Bytes>> {
        let mut call = Call {
            operation: Operation::Run,
            task: None,
            options,
        };
        self.apply_filters(&mut call)?;

        let queue = self.adapter(&call.options.config).await?;
        queue
            .run(RunOptions {
                timeout: call.options.timeout,
                tube: call.options.tube,
            })
            .await
    }

    /// Drains the configured adapter, returning how many jobs were deleted.
    pub async fn reset(&self, options: CallOptions) -> Result<u64> {
        let mut call = Call {
            operation: Operation::Reset,
            task: None,
            options,
        };
        self.apply_filters(&mut call)?;

        let queue = self.adapter(&call.options.config).await?;
        let defaults = ResetOptions::default();
        queue
            .reset(ResetOptions {
                timeout: call.options.timeout.unwrap_or(defaults.timeout),
                tube: call.options.tube,
            })
            .await
    }

    /// Forgets every cached adapter. Adapters still referenced elsewhere stay
    /// alive until those references go.
    pub async fn clear(&self) {
        self.instances.lock().await.clear();
    }
}
