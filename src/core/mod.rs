//! Core data model
//!
//! File entries, parsed trees and findings shared by every component.

pub mod types;

pub use types::{FileEntry, FileEntryWithAst, Level, Occurrence, SyntaxTree};
