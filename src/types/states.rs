use serde::{Deserialize, Serialize};

/// The server-side state of a job. Transitions are decided by the server; a
/// client only ever observes them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Ready,
    Delayed,
    Reserved,
    Buried,
}
