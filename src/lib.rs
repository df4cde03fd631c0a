/// Pump Driver Library
///
/// Shared modules for the Chemyx pump GUI and command-line runner

pub mod config_loader;
pub mod pump_connection;
pub mod cached_connection;
pub mod steps;
pub mod executor;
