pub mod config;
pub mod errors;
pub mod generator;
pub mod github;
pub mod mail;
pub mod models;
pub mod notify;
pub mod patch;
pub mod queue;
pub mod testing;
pub mod worker;
