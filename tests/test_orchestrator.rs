use inquisidor::core::types::PARSE_ERROR_KIND;
use inquisidor::frontend::ParseError;
use inquisidor::infrastructure::PriorityWeights;
use inquisidor::{
    AnalysisContext, Config, FileEntry, FileEntryWithAst, FileTechnique, GuardianStatus, Inquisidor,
    InquisidorError, Level, Occurrence, PythonParser, RunOptions, SourceParser, StructuredEvent, SyntaxTree,
    Technique, TechniqueError,
};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const MODULE_A: &str = "import os\n# TODO: tidy\n\ndef add(x, y):\n    return x + y\n";
const MODULE_B: &str = "import os\nimport sys\n\nclass Greeter:\n    def hello(self):\n        return 'hi'\n";
const MODULE_C: &str = "from pathlib import Path\nVALUE = 1\n";

fn config(temp: &TempDir) -> Config {
    let mut config = Config::default().resolve_paths(temp.path());
    config.pool.max_workers = 2;
    config.pool.batch_size = 1;
    config
}

fn project() -> Vec<FileEntry> {
    vec![
        FileEntry::in_memory("pkg/a.py", MODULE_A),
        FileEntry::in_memory("pkg/b.py", MODULE_B),
        FileEntry::in_memory("c.py", MODULE_C),
    ]
}

fn read_state(config: &Config) -> Value {
    serde_json::from_str(&fs::read_to_string(&config.incremental.state_path).unwrap()).unwrap()
}

fn reuse_count(state: &Value, rel: &str) -> u64 {
    state["arquivos"][rel]["reaproveitadoCount"].as_u64().unwrap()
}

fn sorted(mut occurrences: Vec<Occurrence>) -> Vec<Occurrence> {
    occurrences.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    occurrences
}

#[test]
fn test_second_process_hits_cache_and_reuses() {
    let temp = TempDir::new().unwrap();
    let options = RunOptions::new(temp.path());

    let first = Inquisidor::new(config(&temp)).run(project(), &options).unwrap();
    assert_eq!(first.cache.misses, 3);
    assert_eq!(first.cache.hits, 0);
    assert_eq!(first.files_analyzed, 3);
    assert_eq!(first.guardian.as_ref().unwrap().status, GuardianStatus::BaselineCreated);

    // Fresh instance, same persisted state
    let second = Inquisidor::new(config(&temp)).run(project(), &options).unwrap();
    assert_eq!(second.cache.misses, 0);
    assert_eq!(second.cache.hits, 3);
    assert_eq!(second.files_reused, 3);
    assert_eq!(second.files_analyzed, 0);
    assert_eq!(second.guardian.as_ref().unwrap().status, GuardianStatus::Ok);
    assert_eq!(sorted(first.occurrences), sorted(second.occurrences));
}

struct CountingParser(Arc<AtomicUsize>);

impl SourceParser for CountingParser {
    fn parse(&self, content: &str, extension: &str) -> Result<Option<SyntaxTree>, ParseError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        PythonParser.parse(content, extension)
    }
}

#[test]
fn test_unchanged_file_parsed_once_across_runs() {
    let temp = TempDir::new().unwrap();
    let options = RunOptions::new(temp.path());
    let calls = Arc::new(AtomicUsize::new(0));
    let files = || vec![FileEntry::in_memory("only.py", MODULE_A)];

    let first = Inquisidor::new(config(&temp))
        .with_parser(Arc::new(CountingParser(Arc::clone(&calls))))
        .run(files(), &options)
        .unwrap();
    let second = Inquisidor::new(config(&temp))
        .with_parser(Arc::new(CountingParser(Arc::clone(&calls))))
        .run(files(), &options)
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.cache.misses + second.cache.misses, 1);
    assert_eq!(first.cache.hits + second.cache.hits, 1);
}

#[test]
fn test_reuse_keeps_global_results() {
    let temp = TempDir::new().unwrap();
    let options = RunOptions::new(temp.path());
    let files = || {
        vec![
            FileEntry::in_memory("a.py", "import os, sys\n"),
            FileEntry::in_memory("b.py", "import sys\n"),
        ]
    };
    let usage = |report: &inquisidor::RunReport| -> Vec<String> {
        report
            .occurrences
            .iter()
            .filter(|o| o.kind == "padrao-uso")
            .map(|o| o.message.clone())
            .collect()
    };

    let first = Inquisidor::new(config(&temp)).run(files(), &options).unwrap();
    let second = Inquisidor::new(config(&temp)).run(files(), &options).unwrap();

    assert_eq!(second.files_reused, 2);
    assert_eq!(usage(&first), vec!["module 'sys' imported by 2 files".to_string()]);
    assert_eq!(usage(&first), usage(&second));
}

#[test]
fn test_same_instance_hits_in_memory_cache() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.incremental.reuse_results = false;
    let inquisidor = Inquisidor::new(config);
    let options = RunOptions::new(temp.path());

    inquisidor.run(project(), &options).unwrap();
    let second = inquisidor.run(project(), &options).unwrap();

    assert_eq!(second.files_reused, 0);
    assert_eq!(second.files_analyzed, 3);
    assert_eq!(second.cache.misses, 0);
    assert_eq!(second.cache.hits, 3);
}

#[test]
fn test_reuse_count_tracks_unchanged_runs() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let options = RunOptions::new(temp.path());

    Inquisidor::new(config.clone()).run(project(), &options).unwrap();
    assert_eq!(reuse_count(&read_state(&config), "c.py"), 0);

    Inquisidor::new(config.clone()).run(project(), &options).unwrap();
    assert_eq!(reuse_count(&read_state(&config), "c.py"), 1);

    Inquisidor::new(config.clone()).run(project(), &options.clone().without_guardian()).unwrap();
    let state = read_state(&config);
    assert_eq!(reuse_count(&state, "c.py"), 2);
    assert!(state["arquivos"]["pkg/a.py"]["analistas"]["todo-comments"]["duracaoMs"].is_number());

    let mut changed = project();
    changed[2] = FileEntry::in_memory("c.py", "VALUE = 2\n");
    Inquisidor::new(config.clone()).run(changed, &options.without_guardian()).unwrap();
    let state = read_state(&config);
    assert_eq!(reuse_count(&state, "c.py"), 0);
    assert_eq!(reuse_count(&state, "pkg/a.py"), 3);
}

#[test]
fn test_parse_failure_degrades() {
    let temp = TempDir::new().unwrap();
    let mut files = project();
    files.push(FileEntry::in_memory("broken.py", "def broken(:\n    # TODO: fix\n"));

    let report = Inquisidor::new(config(&temp))
        .run(files, &RunOptions::new(temp.path()))
        .unwrap();

    assert_eq!(report.parse_failures, 1);
    assert_eq!(report.cache.failures, 1);
    assert_eq!(report.files_analyzed, 4);

    let broken: Vec<&Occurrence> = report.occurrences_for("broken.py").collect();
    assert!(broken.iter().any(|o| o.kind == PARSE_ERROR_KIND && o.level == Level::Erro));
    // Techniques that do not need a tree still run
    assert!(broken.iter().any(|o| o.kind == "todo"));
    assert!(report.occurrences_for("pkg/a.py").any(|o| o.kind == "todo"));
}

#[test]
fn test_guardian_violation_stops_run() {
    let temp = TempDir::new().unwrap();
    let options = RunOptions::new(temp.path());
    Inquisidor::new(config(&temp)).run(project(), &options).unwrap();

    let mut tampered = project();
    tampered[0] = FileEntry::in_memory("pkg/a.py", "import os\n");

    let err = Inquisidor::new(config(&temp)).run(tampered.clone(), &options).unwrap_err();
    match err {
        InquisidorError::Integrity(violation) => {
            assert!(violation.messages.iter().any(|m| m.contains("changed") && m.contains("pkg/a.py")));
        }
        other => panic!("unexpected error {:?}", other),
    }

    let mut diff_only = config(&temp);
    diff_only.guardian.diff_only = true;
    let report = Inquisidor::new(diff_only).run(tampered.clone(), &options).unwrap();
    let guardian = report.guardian.unwrap();
    assert_eq!(guardian.status, GuardianStatus::ChangesDetected);
    assert_eq!(guardian.diff.unwrap().changed, vec!["pkg/a.py".to_string()]);

    let skipped = Inquisidor::new(config(&temp))
        .run(tampered, &options.clone().without_guardian())
        .unwrap();
    assert!(skipped.guardian.is_none());
}

struct Duplicate(&'static str);

impl FileTechnique for Duplicate {
    fn name(&self) -> &str {
        self.0
    }

    fn applies_to(&self, _rel_path: &str) -> bool {
        true
    }

    fn apply(&self, file: &FileEntryWithAst, _ctx: &AnalysisContext) -> Result<Vec<Occurrence>, TechniqueError> {
        Ok(vec![Occurrence::new("dup", Level::Aviso, file.rel_path(), Some(1), "same finding")
            .with_origin(self.0)])
    }
}

#[test]
fn test_identical_occurrences_are_deduplicated() {
    let temp = TempDir::new().unwrap();
    let inquisidor = Inquisidor::new(config(&temp)).with_techniques(vec![
        Technique::file(Duplicate("first")),
        Technique::file(Duplicate("second")),
    ]);

    let report = inquisidor
        .run(vec![FileEntry::in_memory("a.py", "x = 1\n")], &RunOptions::new(temp.path()))
        .unwrap();

    assert_eq!(report.occurrences.len(), 1);
    assert_eq!(report.occurrences[0].origin, "first");
    let summary: Vec<(&str, usize)> = report.metrics.iter().map(|m| (m.name.as_str(), m.occurrences)).collect();
    assert_eq!(summary, vec![("first", 1), ("second", 1)]);
}

#[test]
fn test_structured_events() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.logging.structured = true;
    config.priority = Some(PriorityWeights::default());

    let inquisidor = Inquisidor::new(config);
    let report = inquisidor.run(project(), &RunOptions::new(temp.path())).unwrap();
    let events = inquisidor.events().drain();

    assert_eq!(report.priorities.len(), 3);
    assert_eq!(
        events.iter().filter(|e| matches!(e, StructuredEvent::Priorizacao { .. })).count(),
        3
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, StructuredEvent::Analista { nome, .. } if nome == "todo-comments")));
    assert!(matches!(
        events.last(),
        Some(StructuredEvent::Metricas { arquivos: 3, .. })
    ));
}

#[test]
fn test_priority_puts_new_files_first() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.priority = Some(PriorityWeights::default());
    let options = RunOptions::new(temp.path()).without_guardian();

    Inquisidor::new(config.clone()).run(project(), &options).unwrap();

    let mut files = project();
    files.push(FileEntry::in_memory("z_new.py", "x = 1\n"));
    let report = Inquisidor::new(config).run(files, &options).unwrap();

    assert_eq!(report.priorities[0].rel_path, "z_new.py");
    assert_eq!(report.priorities[0].score, None);
    assert!(report.priorities[1..].iter().all(|d| d.score.is_some()));
}

#[test]
fn test_unwritable_state_does_not_fail_run() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    // A plain file where the state directory should be
    let blocker = temp.path().join("blocker");
    fs::write(&blocker, "not a directory").unwrap();
    config.incremental.state_path = blocker.join("state.json");

    let report = Inquisidor::new(config)
        .run(project(), &RunOptions::new(temp.path()).without_guardian())
        .unwrap();
    assert_eq!(report.files_analyzed, 3);
    assert!(Path::new(&blocker).is_file());
}
