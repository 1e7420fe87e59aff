use crate::core::Level;
use crate::frontend::config::{Config, CONFIG_FILE_NAME};
use crate::frontend::scanner::scan;
use crate::guardian::GuardianStatus;
use crate::infrastructure::logging::{init_logging, LogConfig, LogFormat};
use crate::inquisidor::{Inquisidor, InquisidorError, RunOptions, RunReport};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub path: PathBuf,
    pub config_path: Option<PathBuf>,
    pub skip_guardian: bool,
    pub accept_baseline: bool,
    pub diff_only: bool,
    pub json_logs: bool,
    /// Log JSON lines into a daily rolling file under this directory
    pub log_dir: Option<PathBuf>,
    pub color: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            config_path: None,
            skip_guardian: false,
            accept_baseline: false,
            diff_only: false,
            json_logs: false,
            log_dir: None,
            color: true,
        }
    }
}

pub struct Cli {
    config: CliConfig,
}

impl Cli {
    pub fn new(config: CliConfig) -> Self {
        Self { config }
    }

    pub fn load_config(&self) -> Result<Config, String> {
        let base = &self.config.path;
        let mut config = match &self.config.config_path {
            Some(path) => Config::load(path).map_err(|e| e.to_string())?,
            None => Config::discover(base),
        };

        if self.config.diff_only {
            config.guardian.diff_only = true;
        }
        if self.config.skip_guardian {
            config.guardian.enabled = false;
        }
        Ok(config.resolve_paths(base))
    }

    /// Subscriber settings: `[logging] level` from the config file, output and
    /// format from the command line
    pub fn log_config(&self, config: &Config) -> LogConfig {
        let base = match &self.config.log_dir {
            Some(dir) => LogConfig::production(dir),
            None if self.config.json_logs => LogConfig::new().with_format(LogFormat::Json),
            None => LogConfig::new().with_format(LogFormat::Compact),
        };
        base.with_level_str(&config.logging.level)
    }

    /// Exit code: 0 clean, 1 findings at error level or run errors, 2 integrity violation
    pub fn run(&self) -> Result<i32, String> {
        let config = self.load_config()?;
        self.run_with(config)
    }

    pub fn run_with(&self, config: Config) -> Result<i32, String> {
        let base = &self.config.path;
        if !base.is_dir() {
            return Err(format!("Path not found: {}", base.display()));
        }

        let files = scan(base, &config.scan).map_err(|e| format!("Scan pattern error: {}", e))?;
        info!(files = files.len(), "Scanned {}", base.display());

        let inquisidor = Inquisidor::new(config);

        if self.config.accept_baseline {
            let Some(guardian) = inquisidor.guardian() else {
                return Err("Guardian is disabled; nothing to accept".to_string());
            };
            let entries: Vec<_> = files.into_values().collect();
            let report = guardian.accept(&entries).map_err(|e| e.to_string())?;
            self.print_success(&format!("Baseline accepted with {} entries", report.snapshot_size));
            return Ok(0);
        }

        let options = RunOptions::new(base.clone());
        match inquisidor.run(files.into_values(), &options) {
            Ok(report) => {
                self.print_report(&report);
                let failed = report.has_errors() || report.occurrences.iter().any(|o| o.level == Level::Erro);
                Ok(if failed { 1 } else { 0 })
            }
            Err(InquisidorError::Integrity(violation)) => {
                for message in &violation.messages {
                    self.print_error(message);
                }
                self.print_error("Integrity check failed; run with --accept-baseline to accept the changes");
                Ok(2)
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn print_report(&self, report: &RunReport) {
        for occurrence in &report.occurrences {
            match occurrence.level {
                Level::Erro => self.print_error(&occurrence.to_string()),
                _ => println!("{}", occurrence),
            }
        }

        if let Some(guardian) = &report.guardian {
            if guardian.status == GuardianStatus::ChangesDetected {
                for violation in &guardian.violations {
                    self.print_error(&format!("guardian (diff-only): {}", violation));
                }
            }
            println!("guardian: {}", guardian.status);
        }

        for error in &report.pool_errors {
            self.print_error(&error.to_string());
        }

        let summary = format!(
            "Checked {} file{} ({} analyzed, {} reused): {} occurrence{}, {} error{}, cache hit rate {:.0}%",
            report.files_total,
            if report.files_total == 1 { "" } else { "s" },
            report.files_analyzed,
            report.files_reused,
            report.occurrences.len(),
            if report.occurrences.len() == 1 { "" } else { "s" },
            report.total_errors,
            if report.total_errors == 1 { "" } else { "s" },
            report.cache.hit_rate() * 100.0
        );
        if report.has_errors() {
            self.print_error(&summary);
        } else {
            self.print_success(&summary);
        }
    }

    fn print_error(&self, msg: &str) {
        if self.config.color {
            eprintln!("\x1b[31m{}\x1b[0m", msg);
        } else {
            eprintln!("{}", msg);
        }
    }

    fn print_success(&self, msg: &str) {
        if self.config.color {
            println!("\x1b[32m{}\x1b[0m", msg);
        } else {
            println!("{}", msg);
        }
    }
}

pub fn parse_args() -> Result<CliConfig, String> {
    parse_args_from(std::env::args())
}

pub fn parse_args_from<I>(args: I) -> Result<CliConfig, String>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    let program = args.first().map(String::as_str).unwrap_or("inquisidor");

    let mut config = CliConfig::default();
    let mut path = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires an argument".to_string());
                }
                config.config_path = Some(PathBuf::from(&args[i]));
            }
            "--no-guardian" => config.skip_guardian = true,
            "--accept-baseline" => config.accept_baseline = true,
            "--diff-only" => config.diff_only = true,
            "--json-logs" => config.json_logs = true,
            "--log-dir" => {
                i += 1;
                if i >= args.len() {
                    return Err("--log-dir requires an argument".to_string());
                }
                config.log_dir = Some(PathBuf::from(&args[i]));
            }
            "--no-color" => config.color = false,
            "-h" | "--help" => {
                return Err(format!(
                    "Usage: {} [OPTIONS] <dir>\n\nOptions:\n  \
                     --config FILE      Configuration file (default: nearest {})\n  \
                     --no-guardian      Skip the integrity check\n  \
                     --accept-baseline  Replace the integrity baseline and exit\n  \
                     --diff-only        Report integrity changes without failing\n  \
                     --json-logs        Log as JSON lines\n  \
                     --log-dir DIR      Write JSON logs to a daily file in DIR\n  \
                     --no-color         Disable colored output",
                    program, CONFIG_FILE_NAME
                ));
            }
            arg if arg.starts_with("--") => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg => {
                if path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                path = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    if let Some(path) = path {
        config.path = path;
    }
    Ok(config)
}

/// Entry point for the `inquisidor` binary
pub fn main() -> Result<i32, String> {
    let cli = Cli::new(parse_args()?);
    let config = cli.load_config()?;
    let _guard = init_logging(cli.log_config(&config));

    cli.run_with(config).map_err(|e| {
        error!("{}", e);
        e
    })
}
