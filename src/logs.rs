// src/logs.rs
//
// =============================================================================
// NNPAL: PHASE LOGGER
// =============================================================================
//
// Every invocation leaves a trace next to the workspace so the operator can
// audit what a phase did long after the terminal is gone.
//
// `PhaseLogger` forwards records to `env_logger` (console, honours RUST_LOG)
// and appends the same records to `<step>_<phase>.log`.

use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::Mutex;

pub struct PhaseLogger {
    console: env_logger::Logger,
    file: Option<Mutex<LineWriter<File>>>,
    level: LevelFilter,
}

impl PhaseLogger {
    /// Installs the global logger. `verbose` switches from info to debug.
    /// A log file that cannot be opened degrades to console-only logging.
    pub fn init(log_path: Option<&Path>, verbose: bool) -> anyhow::Result<()> {
        let level = if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };

        let console = env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .build();

        let file = match log_path {
            Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => Some(Mutex::new(LineWriter::new(f))),
                Err(e) => {
                    eprintln!("cannot open log file {:?}: {}", path, e);
                    None
                }
            },
            None => None,
        };

        let max = console.filter().max(level);
        let logger = Box::new(PhaseLogger {
            console,
            file,
            level,
        });
        // The `log` facade needs a 'static logger for the whole process.
        log::set_logger(Box::leak(logger)).map_err(|e| anyhow::anyhow!("{}", e))?;
        log::set_max_level(max);
        Ok(())
    }

    fn format_line(record: &Record) -> String {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        // "nnpal::phases::exploration" -> "exploration"
        let target = record.target().rsplit("::").next().unwrap_or(record.target());
        format!("[{} {:<5} {}] {}", timestamp, record.level(), target, record.args())
    }
}

impl Log for PhaseLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level || self.console.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.console.matches(record) {
            self.console.log(record);
        }
        if record.level() <= self.level {
            if let Some(file) = &self.file {
                if let Ok(mut w) = file.lock() {
                    let _ = writeln!(w, "{}", Self::format_line(record));
                }
            }
        }
    }

    fn flush(&self) {
        self.console.flush();
        if let Some(file) = &self.file {
            if let Ok(mut w) = file.lock() {
                let _ = w.flush();
            }
        }
    }
}
