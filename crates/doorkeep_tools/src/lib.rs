#![forbid(unsafe_code)]

pub mod dashboard_cli;
