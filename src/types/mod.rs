pub mod job;
pub mod protocol;
pub mod serialisable;
pub mod states;
pub mod stats;
