pub mod cli;
pub mod config;
pub mod frames;
pub mod handlers;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod ws_agent;
pub mod ws_viewer;
