pub mod asyncutil;
pub mod backend;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod logtail;
pub mod web_console;
