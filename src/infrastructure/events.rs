//! Structured run events
//!
//! When structured logging is on, each event is serialized to one JSON line and
//! emitted under the `inquisidor::eventos` target. Events are also buffered so
//! callers can inspect them after a run.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tipo", rename_all = "lowercase")]
pub enum StructuredEvent {
    /// One technique's aggregated numbers for the run
    #[serde(rename_all = "camelCase")]
    Analista {
        nome: String,
        duracao_ms: f64,
        ocorrencias: usize,
        execucoes: usize,
        global: bool,
    },

    /// Run-level totals
    #[serde(rename_all = "camelCase")]
    Metricas {
        arquivos: usize,
        analisados: usize,
        reaproveitados: usize,
        ocorrencias: usize,
        erros: usize,
        cache_hits: u64,
        cache_misses: u64,
        parse_ms: f64,
        duracao_ms: f64,
    },

    /// Where a file landed in the dispatch order and why
    #[serde(rename_all = "camelCase")]
    Priorizacao {
        arquivo: String,
        posicao: usize,
        score: Option<f64>,
    },
}

#[derive(Debug, Default)]
pub struct EventLog {
    enabled: bool,
    events: Mutex<Vec<StructuredEvent>>,
}

impl EventLog {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// No-op unless structured logging is enabled
    pub fn emit(&self, event: StructuredEvent) {
        if !self.enabled {
            return;
        }

        match serde_json::to_string(&event) {
            Ok(line) => info!(target: "inquisidor::eventos", "{}", line),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize structured event"),
        }
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<StructuredEvent> {
        self.events.lock().clone()
    }

    pub fn drain(&self) -> Vec<StructuredEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}
