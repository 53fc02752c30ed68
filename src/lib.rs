#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod connection;
pub mod error;
pub mod event;
mod facade;
mod monitor;
pub mod options;
pub(crate) mod pool;
pub(crate) mod rpc;
pub(crate) mod runtime;
pub(crate) mod task;
#[cfg(test)]
pub(crate) mod test_support;
pub(crate) mod transport;

pub use crate::{
    error::{Error, ErrorKind, Result},
    event::PoolEventHandler,
    facade::GraphClient,
    monitor::MonitorStats,
    options::{PoolOptions, ServerAddress},
    pool::{ExecuteOptions, PoolStats},
    task::ExecuteOutcome,
};
