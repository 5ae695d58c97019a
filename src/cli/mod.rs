pub mod commands;

pub use commands::{AuditCommands, Cli, Commands, WaCommands};
