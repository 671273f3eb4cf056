pub mod agents;
pub mod anvil_config;
pub mod budget;
pub mod config;
pub mod doctor;
pub mod errors;
pub mod exit_codes;
pub mod hints;
pub mod init;
pub mod lease;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod patch;
pub mod plan;
pub mod store;
pub mod tracker;
