use std::path::PathBuf;

use clap::{Parser, Subcommand};
use enchanted_queue::registry::DEFAULT_CONFIG;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// YAML file of named queue configurations. Without one, `default` is a
    /// beanstalkd server on 127.0.0.1:11300.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Queues a task, with an optional payload appended to it.
    Add {
        task: String,
        payload: Option<String>,
        /// Named configuration to use.
        #[arg(value_name = "CONFIG", default_value = DEFAULT_CONFIG)]
        name: String,
    },
    /// Takes one job off the queue and prints its body.
    Run {
        #[arg(value_name = "CONFIG", default_value = DEFAULT_CONFIG)]
        name: String,
        /// Seconds to wait for a job; waits indefinitely if unset.
        #[arg(short, long)]
        timeout: Option<u32>,
    },
    /// Deletes every job on the queue and prints how many there were.
    Reset {
        #[arg(value_name = "CONFIG", default_value = DEFAULT_CONFIG)]
        name: String,
        /// Stop once no job arrives for this many seconds.
        #[arg(short, long, default_value_t = 1)]
        timeout: u32,
    },
    /// Prints beanstalkd server statistics.
    Stats {
        #[arg(value_name = "CONFIG", default_value = DEFAULT_CONFIG)]
        name: String,
    },
}
