#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod backend;
pub mod cli;
pub mod config;
pub mod disk;
pub mod download;
pub mod error;
pub mod logging;
pub mod network;
pub mod paths;
pub mod prompt;
pub mod status;
pub mod storage;
pub mod util;
pub mod vbox;
