//! YAML bodies of the `stats` and `list-tubes` command families.
//!
//! Servers add fields between versions, so unknown keys are ignored and
//! missing ones default to zero.
use serde::{Deserialize, Serialize};

use super::states::JobState;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobStats {
    /// job ID
    pub id: u64,
    /// tube containing job
    pub tube: String,
    /// job state
    pub state: JobState,
    /// priority set by last put/release/bury
    pub pri: u32,

    /// time in seconds since creation
    #[serde(default)]
    pub age: u64,
    /// seconds remaining until ready
    #[serde(default)]
    pub delay: u64,
    /// allowed processing time in seconds
    #[serde(default)]
    pub ttr: u64,
    /// time until job returns to ready queue
    #[serde(default, rename = "time-left")]
    pub time_left: u64,

    /// earliest binlog file containing job
    #[serde(default)]
    pub file: u64,

    /// number of times job reserved
    #[serde(default)]
    pub reserves: u64,
    /// number of times job timed out
    #[serde(default)]
    pub timeouts: u64,
    /// number of times job released
    #[serde(default)]
    pub releases: u64,
    /// number of times job buried
    #[serde(default)]
    pub buries: u64,
    /// number of times job kicked
    #[serde(default)]
    pub kicks: u64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TubeStats {
    /// tube name
    pub name: String,
    /// number of jobs in ready state with priority < 1024
    pub current_jobs_urgent: u64,
    /// number of jobs in ready state
    pub current_jobs_ready: u64,
    /// number of jobs reserved by clients
    pub current_jobs_reserved: u64,
    /// number of jobs in delayed state
    pub current_jobs_delayed: u64,
    /// number of jobs in buried state
    pub current_jobs_buried: u64,
    /// total jobs created in this tube
    pub total_jobs: u64,
    /// number of clients that have `use`d this tube
    pub current_using: u64,
    /// number of clients waiting on a `reserve` that watches this tube
    pub current_waiting: u64,
    /// number of clients that have `watch`ed this tube
    pub current_watching: u64,
    /// number of seconds the tube has been paused for
    pub pause: u64,
    /// number of `delete` commands issued for this tube
    pub cmd_delete: u64,
    /// number of `pause-tube` commands issued for this tube
    pub cmd_pause_tube: u64,
    /// seconds remaining until the tube is un-paused
    pub pause_time_left: u64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerStats {
    /// number of ready jobs with priority < 1024
    pub current_jobs_urgent: u64,
    /// number of jobs in the ready queue
    pub current_jobs_ready: u64,
    /// number of jobs reserved by all clients
    pub current_jobs_reserved: u64,
    /// number of delayed jobs
    pub current_jobs_delayed: u64,
    /// number of buried jobs
    pub current_jobs_buried: u64,

    pub cmd_put: u64,
    pub cmd_peek: u64,
    pub cmd_reserve: u64,
    pub cmd_reserve_with_timeout: u64,
    pub cmd_delete: u64,
    pub cmd_release: u64,
    pub cmd_bury: u64,
    pub cmd_kick: u64,
    pub cmd_touch: u64,
    pub cmd_stats: u64,

    /// cumulative count of times a job has timed out
    pub job_timeouts: u64,
    /// cumulative count of jobs created
    pub total_jobs: u64,
    /// maximum number of bytes in a job
    pub max_job_size: u64,
    /// number of currently-existing tubes
    pub current_tubes: u64,
    /// number of currently open connections
    pub current_connections: u64,
    /// number of open connections that have each issued at least one put
    pub current_producers: u64,
    /// number of open connections that have each issued at least one reserve
    pub current_workers: u64,
    /// number of open connections waiting on a reserve
    pub current_waiting: u64,
    /// cumulative count of connections
    pub total_connections: u64,
    /// process id of the server
    pub pid: u32,
    /// version string of the server
    pub version: String,
    /// cumulative user CPU time in seconds
    pub rusage_utime: f64,
    /// cumulative system CPU time in seconds
    pub rusage_stime: f64,
    /// number of seconds since this server process started running
    pub uptime: u64,
    /// is server is in drain mode
    pub draining: bool,
    /// random id string for this server process
    pub id: String,
    pub hostname: String,
}
