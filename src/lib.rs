//! A beanstalkd client with a uniform produce/consume layer over it.
//!
//! [`adapter::beanstalk::Beanstalk`] speaks the beanstalkd text protocol;
//! [`adapter::memory::Memory`] keeps jobs in-process. Both implement
//! [`Queue`], and [`Registry`] hands them out by configuration name.

pub mod adapter;
pub mod config;
pub mod error;
pub mod format;
pub mod line_reader;
pub mod message;
pub mod parser;
pub mod registry;
pub mod service;
pub mod types;
pub mod util;

pub use adapter::{Flow, Queue, QueueExt};
pub use config::{AdapterConfig, ConfigStore};
pub use error::{QueueError, Result};
pub use format::Format;
pub use message::Message;
pub use registry::Registry;
