//! Live container log streaming

pub mod watchdog;
