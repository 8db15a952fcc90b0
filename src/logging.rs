//! Log output for the CLI (env_logger on stderr) and, with the `python`
//! feature, a bridge into Python's `logging` module.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

#[cfg(feature = "python")]
pub use python::{
    init_python_logging, reset_python_logging_cache, set_python_log_level,
    set_python_log_level_str,
};

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "POTENTIOSTAT_LOG";

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize logging for Rust binaries (stderr formatter) based on
/// `POTENTIOSTAT_LOG`/`RUST_LOG`. `verbosity` raises the level above the
/// environment default (1 = debug, 2+ = trace).
pub fn init_rust_logging(verbosity: u8) {
    let level = match verbosity {
        0 => env_level(),
        1 => env_level().max(LevelFilter::Debug),
        _ => LevelFilter::Trace,
    };
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::new().filter_or(LOG_ENV, level.as_str());
        let mut builder = env_logger::Builder::from_env(env);
        if verbosity > 0 {
            builder.filter_level(level);
        }
        builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::PyAny;

    use super::{env_level, parse_level};

    static PY_LOGGER: OnceCell<&'static PythonLogger> = OnceCell::new();

    /// Forwards records to `logging.getLogger(<target>)`, with `::` in the
    /// target replaced by `.`.
    struct PythonLogger {
        level: Mutex<LevelFilter>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn python_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PythonLogger {
        fn level(&self) -> LevelFilter {
            self.level.lock().map(|l| *l).unwrap_or(LevelFilter::Off)
        }

        fn logger<'py>(&self, py: Python<'py>, target: &str) -> PyResult<Bound<'py, PyAny>> {
            if let Ok(loggers) = self.loggers.lock() {
                if let Some(logger) = loggers.get(target) {
                    return Ok(logger.bind(py).clone());
                }
            }
            let logger = py
                .import("logging")?
                .call_method1("getLogger", (target,))?;
            if let Ok(mut loggers) = self.loggers.lock() {
                loggers.insert(target.to_string(), logger.clone().unbind());
            }
            Ok(logger)
        }
    }

    impl Log for PythonLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let target = record.target().replace("::", ".");
            Python::attach(|py| {
                let result = self.logger(py, &target).and_then(|logger| {
                    logger.call_method1(
                        "log",
                        (python_level(record.level()), record.args().to_string()),
                    )
                });
                // a failing Python handler must not take the acquisition down
                if let Err(e) = result {
                    e.print(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust log records into Python's `logging`. Only the first call
    /// installs the bridge.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        PY_LOGGER.get_or_try_init(|| -> PyResult<&'static PythonLogger> {
            py.import("logging")?;
            let level = env_level();
            let logger: &'static PythonLogger = Box::leak(Box::new(PythonLogger {
                level: Mutex::new(level),
                loggers: Mutex::new(HashMap::new()),
            }));
            if log::set_logger(logger).is_ok() {
                log::set_max_level(level);
            }
            Ok(logger)
        })?;
        Ok(())
    }

    /// Forget cached Python loggers (after Python's logging was reconfigured).
    pub fn reset_python_logging_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            if let Ok(mut loggers) = logger.loggers.lock() {
                loggers.clear();
            }
        }
    }

    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            if let Ok(mut current) = logger.level.lock() {
                *current = level;
            }
        }
        reset_python_logging_cache();
        log::set_max_level(level);
        Ok(())
    }

    /// Like [`set_python_log_level`] with a level name; unknown or missing
    /// names fall back to the environment.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        set_python_log_level(py, parse_level(level).unwrap_or_else(env_level))
    }
}
