pub mod cli;
pub mod destination;
pub mod load_config;
pub mod source;
pub mod telemetry;

pub use cli::{run, Cli, Commands};
