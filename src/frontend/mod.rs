//! Frontend components
//!
//! External collaborators of the orchestrator: the source parser, the file
//! scanner, configuration and the command-line entry point.

pub mod cli;
pub mod config;
pub mod parser;
pub mod scanner;

pub use cli::main as cli_main;
pub use config::{Config, ConfigError};
pub use parser::{ParseError, PythonParser, SourceParser};
pub use scanner::scan;
