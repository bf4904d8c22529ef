//! tether - run commands, scripts, tasks and plans across many targets
//!
//! One action fans out over a target list through a transport per protocol
//! (ssh, winrm, local, docker, remote, pcp) and comes back as an ordered
//! [`ResultSet`](result::ResultSet). Plans sequence many such dispatches.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod models;
pub mod plan;
pub mod pool;
pub mod rerun;
pub mod result;
pub mod target;
pub mod tasks;
pub mod templates;
pub mod transports;
