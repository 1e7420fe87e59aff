//! Parser collaborator
//!
//! The core only sees [`SourceParser`]; this module also ships a Python parser
//! backed by `rustpython-parser`.

use crate::core::SyntaxTree;
use rustpython_parser::ast::Mod;
use rustpython_parser::{parse, Mode};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("parse timed out after {0} ms")]
    Timeout(u64),

    #[error("parser unit disconnected: {0}")]
    Disconnected(String),
}

/// Parser collaborator.
///
/// Returns `Ok(None)` for extensions the parser does not support.
pub trait SourceParser: Send + Sync {
    fn parse(&self, content: &str, extension: &str) -> Result<Option<SyntaxTree>, ParseError>;
}

/// Line index for byte offset to line conversion
#[derive(Debug, Clone)]
pub struct LineIndex {
    /// Byte offsets where each line starts
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, ch) in source.char_indices() {
            if ch == '\n' {
                line_starts.push(i + 1);
            }
        }
        Self { line_starts }
    }

    /// 1-indexed line containing `offset`
    pub fn line_of(&self, offset: usize) -> usize {
        match self.line_starts.binary_search(&offset) {
            Ok(line) => line + 1,
            Err(line) => line,
        }
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }
}

/// Tree produced by [`PythonParser`]
#[derive(Debug)]
pub struct PythonModule {
    pub module: Mod,
    pub line_index: LineIndex,
}

pub const PYTHON_LANGUAGE: &str = "python";

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonParser;

impl SourceParser for PythonParser {
    #[instrument(skip(self, content), fields(source_len = content.len()))]
    fn parse(&self, content: &str, extension: &str) -> Result<Option<SyntaxTree>, ParseError> {
        if !matches!(extension, "py" | "pyi") {
            return Ok(None);
        }

        debug!("Parsing python module");
        let module = parse(content, Mode::Module, "<source>").map_err(|e| ParseError::Syntax(e.to_string()))?;

        Ok(Some(SyntaxTree::new(
            PYTHON_LANGUAGE,
            PythonModule {
                module,
                line_index: LineIndex::new(content),
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_python() {
        let tree = PythonParser
            .parse("def add(x, y):\n    return x + y\n", "py")
            .unwrap()
            .unwrap();
        assert_eq!(tree.language(), PYTHON_LANGUAGE);
        assert!(tree.downcast_ref::<PythonModule>().is_some());
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(PythonParser.parse("let x = 1;", "rs").unwrap().is_none());
    }

    #[test]
    fn test_syntax_error() {
        let err = PythonParser.parse("def broken(:\n", "py").unwrap_err();
        assert!(matches!(err, ParseError::Syntax(_)));
    }

    #[test]
    fn test_line_index() {
        let index = LineIndex::new("a\nbc\n\nd");
        assert_eq!(index.line_of(0), 1);
        assert_eq!(index.line_of(2), 2);
        assert_eq!(index.line_of(3), 2);
        assert_eq!(index.line_of(5), 3);
        assert_eq!(index.line_of(6), 4);
        assert_eq!(index.line_count(), 4);
    }
}
