//! `conductor` command-line front end.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod cli;
mod commands;
pub mod config;
mod render;

pub use commands::run;
