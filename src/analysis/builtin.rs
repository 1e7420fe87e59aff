//! Built-in techniques

use super::{AnalysisContext, FileTechnique, GlobalTechnique, RunAccumulator, TechniqueError};
use crate::core::{FileEntryWithAst, Level, Occurrence};
use crate::frontend::parser::{PythonModule, PythonParser, SourceParser};
use rustpython_parser::ast::{Mod, Ranged, Stmt};
use std::collections::{BTreeMap, BTreeSet};

const MARKERS: [&str; 3] = ["TODO", "FIXME", "XXX"];

/// Flags lines carrying TODO/FIXME/XXX markers
#[derive(Debug, Clone, Default)]
pub struct TodoComments;

impl FileTechnique for TodoComments {
    fn name(&self) -> &str {
        "todo-comments"
    }

    fn applies_to(&self, _rel_path: &str) -> bool {
        true
    }

    fn apply(&self, file: &FileEntryWithAst, _ctx: &AnalysisContext) -> Result<Vec<Occurrence>, TechniqueError> {
        let occurrences = file
            .entry
            .content
            .lines()
            .enumerate()
            .filter_map(|(idx, line)| {
                let marker = MARKERS.iter().find(|m| line.contains(*m))?;
                Some(
                    Occurrence::new(
                        "todo",
                        Level::Aviso,
                        file.rel_path(),
                        Some(idx + 1),
                        format!("{} marker: {}", marker, line.trim()),
                    )
                    .with_origin(self.name()),
                )
            })
            .collect();
        Ok(occurrences)
    }
}

/// Flags Python functions whose definition spans more than `max_lines`
#[derive(Debug, Clone)]
pub struct LongFunctions {
    pub max_lines: usize,
}

impl Default for LongFunctions {
    fn default() -> Self {
        Self { max_lines: 60 }
    }
}

impl LongFunctions {
    fn visit(&self, stmts: &[Stmt], module: &PythonModule, rel_path: &str, out: &mut Vec<Occurrence>) {
        for stmt in stmts {
            let (name, body) = match stmt {
                Stmt::FunctionDef(def) => (Some(def.name.to_string()), &def.body),
                Stmt::AsyncFunctionDef(def) => (Some(def.name.to_string()), &def.body),
                Stmt::ClassDef(def) => (None, &def.body),
                _ => continue,
            };

            if let Some(name) = name {
                let range = stmt.range();
                let start = module.line_index.line_of(range.start().to_usize());
                let end = module.line_index.line_of(range.end().to_usize());
                let span = end.saturating_sub(start) + 1;
                if span > self.max_lines {
                    out.push(
                        Occurrence::new(
                            "funcao-longa",
                            Level::Aviso,
                            rel_path,
                            Some(start),
                            format!("function '{}' spans {} lines (limit {})", name, span, self.max_lines),
                        )
                        .with_origin(self.name()),
                    );
                }
            }

            self.visit(body, module, rel_path, out);
        }
    }
}

impl FileTechnique for LongFunctions {
    fn name(&self) -> &str {
        "funcoes-longas"
    }

    fn applies_to(&self, rel_path: &str) -> bool {
        rel_path.ends_with(".py") || rel_path.ends_with(".pyi")
    }

    fn requires_ast(&self) -> bool {
        true
    }

    fn apply(&self, file: &FileEntryWithAst, _ctx: &AnalysisContext) -> Result<Vec<Occurrence>, TechniqueError> {
        let Some(module) = file.ast.as_ref().and_then(|ast| ast.downcast_ref::<PythonModule>()) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        if let Mod::Module(m) = &module.module {
            self.visit(&m.body, module, file.rel_path(), &mut out);
        }
        Ok(out)
    }
}

/// Counts imported modules across the whole run
#[derive(Debug, Clone)]
pub struct UsagePatterns {
    /// Minimum number of importing files before a module is reported
    pub min_files: u64,
}

impl Default for UsagePatterns {
    fn default() -> Self {
        Self { min_files: 2 }
    }
}

impl UsagePatterns {
    /// Top-level imports of one file.
    ///
    /// Reused files reach global techniques without a tree, so Python sources
    /// are parsed here when needed; the result never depends on whether the
    /// file was reanalysed or reused.
    fn imports_of(file: &FileEntryWithAst) -> BTreeSet<String> {
        if let Some(module) = file.ast.as_ref().and_then(|ast| ast.downcast_ref::<PythonModule>()) {
            return Self::module_imports(&module.module);
        }

        let reparsed = PythonParser.parse(&file.entry.content, &file.entry.extension()).ok().flatten();
        if let Some(module) = reparsed.as_ref().and_then(|ast| ast.downcast_ref::<PythonModule>()) {
            return Self::module_imports(&module.module);
        }

        // Unparseable or non-Python: line matching
        file.entry
            .content
            .lines()
            .filter_map(|line| {
                let line = line.trim_start();
                let rest = line.strip_prefix("import ").or_else(|| line.strip_prefix("from "))?;
                let name = rest.split(|c: char| c.is_whitespace() || c == ',' || c == ';').next()?;
                let name = name.trim_matches(|c| c == '"' || c == '\'');
                (!name.is_empty()).then(|| name.to_string())
            })
            .collect()
    }

    fn module_imports(module: &Mod) -> BTreeSet<String> {
        let mut imports = BTreeSet::new();
        if let Mod::Module(m) = module {
            for stmt in &m.body {
                match stmt {
                    Stmt::Import(import) => {
                        imports.extend(import.names.iter().map(|alias| alias.name.to_string()));
                    }
                    Stmt::ImportFrom(import) => {
                        if let Some(module) = &import.module {
                            imports.insert(module.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
        imports
    }
}

impl GlobalTechnique for UsagePatterns {
    fn name(&self) -> &str {
        "padroes-uso"
    }

    fn apply(&self, ctx: &AnalysisContext, acc: &mut RunAccumulator) -> Result<Vec<Occurrence>, TechniqueError> {
        let mut first_importer: BTreeMap<String, String> = BTreeMap::new();

        for file in ctx.files.iter() {
            for import in Self::imports_of(file) {
                acc.increment(self.name(), &import);
                first_importer
                    .entry(import)
                    .or_insert_with(|| file.rel_path().to_string());
            }
        }

        let Some(counts) = acc.namespace(self.name()) else {
            return Ok(Vec::new());
        };

        let occurrences = counts
            .iter()
            .filter(|(_, count)| **count >= self.min_files)
            .filter_map(|(module, count)| {
                let rel_path = first_importer.get(module)?;
                Some(
                    Occurrence::new(
                        "padrao-uso",
                        Level::Info,
                        rel_path.clone(),
                        None,
                        format!("module '{}' imported by {} files", module, count),
                    )
                    .with_origin(self.name()),
                )
            })
            .collect();
        Ok(occurrences)
    }
}
