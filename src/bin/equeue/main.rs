mod args;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use enchanted_queue::adapter::beanstalk::Beanstalk;
use enchanted_queue::config::{AdapterConfig, BeanstalkConfig, ConfigStore};
use enchanted_queue::registry::{CallOptions, Registry, DEFAULT_CONFIG};
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use crate::args::{Args, Command};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let result = select! {
        result = begin(args) => result,
        _ = cancel.cancelled() => {
            warn!("interrupted");
            return ExitCode::from(130);
        },
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            error!(error = format!("{error:#}"), "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}

async fn load_store(path: Option<&Path>) -> Result<ConfigStore> {
    let Some(path) = path else {
        let mut store = ConfigStore::new();
        store.set(
            DEFAULT_CONFIG,
            AdapterConfig::Beanstalk(BeanstalkConfig::default()),
        )?;
        return Ok(store);
    };

    let input = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let store = ConfigStore::from_yaml(&input)
        .with_context(|| format!("loading {}", path.display()))?;
    debug!(configs = store.names().count(), "loaded configuration");
    Ok(store)
}

async fn begin(args: Args) -> Result<ExitCode> {
    let registry = Registry::new(load_store(args.config.as_deref()).await?);

    let code = match args.command {
        Command::Add {
            task,
            payload,
            name,
        } => {
            let options = CallOptions {
                payload: payload.map(Bytes::from),
                ..CallOptions::config(name)
            };
            if registry.add(&task, options).await.context("adding task")? {
                info!(%task, "queued");
                ExitCode::SUCCESS
            } else {
                warn!(%task, "queue refused task");
                ExitCode::FAILURE
            }
        },
        Command::Run { name, timeout } => {
            let options = CallOptions {
                timeout,
                ..CallOptions::config(name)
            };
            match registry.run(options).await.context("running job")? {
                Some(body) => {
                    println!("{}", String::from_utf8_lossy(&body));
                    ExitCode::SUCCESS
                },
                None => {
                    info!("no job available");
                    ExitCode::FAILURE
                },
            }
        },
        Command::Reset { name, timeout } => {
            let options = CallOptions {
                timeout: Some(timeout),
                ..CallOptions::config(name)
            };
            let drained =
                registry.reset(options).await.context("resetting queue")?;
            println!("{drained}");
            ExitCode::SUCCESS
        },
        Command::Stats { name } => {
            let AdapterConfig::Beanstalk(config) = registry.store().get(&name)?
            else {
                bail!("configuration `{name}` is not a beanstalk queue");
            };
            let queue = Beanstalk::open(config.clone()).await?;
            let stats = queue.stats().await.context("fetching stats")?;
            print!("{}", serde_yaml::to_string(&stats)?);
            ExitCode::SUCCESS
        },
    };

    Ok(code)
}
