pub mod commands;
pub mod downloader;
pub mod joiner;
pub mod planner;
pub mod state;
pub mod utils;
