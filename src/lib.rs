//! Front end of the `deliver` tool: command line, configuration file,
//! logging setup and outcome reporting. Delivery itself lives in the
//! `deliver-scp` crate.

pub mod cli;
pub mod config;
pub mod logging;
pub mod report;
