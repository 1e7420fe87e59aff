use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A scanned source file.
///
/// `rel_path` is project-relative with forward slashes and is the key used by
/// every cache, snapshot and diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub rel_path: String,
    pub full_path: PathBuf,
    pub content: Arc<str>,
}

impl FileEntry {
    pub fn new(rel_path: impl Into<String>, full_path: impl Into<PathBuf>, content: impl Into<Arc<str>>) -> Self {
        Self {
            rel_path: normalize_rel_path(&rel_path.into()),
            full_path: full_path.into(),
            content: content.into(),
        }
    }

    /// Entry whose full path is the relative path itself
    pub fn in_memory(rel_path: impl Into<String>, content: impl Into<Arc<str>>) -> Self {
        let rel_path = normalize_rel_path(&rel_path.into());
        let full_path = PathBuf::from(&rel_path);
        Self {
            rel_path,
            full_path,
            content: content.into(),
        }
    }

    /// File extension without the leading dot, lowercased
    pub fn extension(&self) -> String {
        Path::new(&self.rel_path)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Empty or whitespace-only content
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

pub fn normalize_rel_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized.trim_start_matches("./").to_string()
}

/// Opaque parsed syntax tree.
///
/// The core never looks inside; techniques downcast to the concrete tree type
/// produced by the parser they expect.
#[derive(Clone)]
pub struct SyntaxTree {
    language: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl SyntaxTree {
    pub fn new<T: Any + Send + Sync>(language: &'static str, tree: T) -> Self {
        Self {
            language,
            inner: Arc::new(tree),
        }
    }

    pub fn language(&self) -> &'static str {
        self.language
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &SyntaxTree) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SyntaxTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntaxTree")
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

/// File entry after the AST cache step
#[derive(Debug, Clone)]
pub struct FileEntryWithAst {
    pub entry: FileEntry,
    pub ast: Option<SyntaxTree>,
    /// Set when parsing failed or timed out
    pub parse_failure: Option<String>,
}

impl FileEntryWithAst {
    pub fn new(entry: FileEntry, ast: Option<SyntaxTree>) -> Self {
        Self {
            entry,
            ast,
            parse_failure: None,
        }
    }

    pub fn failed(entry: FileEntry, reason: impl Into<String>) -> Self {
        Self {
            entry,
            ast: None,
            parse_failure: Some(reason.into()),
        }
    }

    pub fn rel_path(&self) -> &str {
        &self.entry.rel_path
    }
}

/// Occurrence level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Aviso,
    Erro,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Aviso => write!(f, "aviso"),
            Self::Erro => write!(f, "erro"),
        }
    }
}

/// A single finding emitted by a technique.
///
/// Identity for deduplication is `rel_path + line + kind + message`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Occurrence {
    #[serde(rename = "tipo")]
    pub kind: String,
    #[serde(rename = "gravidade", default)]
    pub severity: u8,
    #[serde(rename = "nivel")]
    pub level: Level,
    #[serde(rename = "relPath")]
    pub rel_path: String,
    #[serde(rename = "linha", default)]
    pub line: Option<usize>,
    #[serde(rename = "mensagem")]
    pub message: String,
    #[serde(rename = "origem", default)]
    pub origin: String,
}

/// Kind used for files whose parse failed or timed out
pub const PARSE_ERROR_KIND: &str = "erro-parse";

/// Kind used when a technique itself fails on a file
pub const TECHNIQUE_ERROR_KIND: &str = "erro-analista";

impl Occurrence {
    pub fn new(
        kind: impl Into<String>,
        level: Level,
        rel_path: impl Into<String>,
        line: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        let severity = match level {
            Level::Info => 1,
            Level::Aviso => 2,
            Level::Erro => 3,
        };
        Self {
            kind: kind.into(),
            severity,
            level,
            rel_path: rel_path.into(),
            line,
            message: message.into(),
            origin: String::new(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = severity;
        self
    }

    pub fn parse_error(rel_path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR_KIND, Level::Erro, rel_path, None, reason).with_origin("parser")
    }

    pub fn technique_error(rel_path: impl Into<String>, technique: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            TECHNIQUE_ERROR_KIND,
            Level::Erro,
            rel_path,
            None,
            format!("technique '{}' failed: {}", technique, reason),
        )
        .with_origin(technique.to_string())
    }

    /// Deduplication identity
    pub fn identity(&self) -> (&str, Option<usize>, &str, &str) {
        (&self.rel_path, self.line, &self.kind, &self.message)
    }
}

impl fmt::Display for Occurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: [{}] {}: {}", self.rel_path, line, self.level, self.kind, self.message),
            None => write!(f, "{}: [{}] {}: {}", self.rel_path, self.level, self.kind, self.message),
        }
    }
}
