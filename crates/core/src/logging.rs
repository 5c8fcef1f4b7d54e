//! Logging bootstrap pieces: filter selection, the rolling file sink and the
//! panic hook that persists crash artifacts.
//!
//! Everything here returns a plan instead of failing, so a broken log
//! directory degrades to console-only logging.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::{self, Write},
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=warn,hyper=info,tower_http=info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "superres";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

/// Process-wide panic hook bookkeeping.
struct CrashHook {
    install: Mutex<()>,
    dir: OnceLock<PathBuf>,
    writing: AtomicBool,
    sequence: AtomicU64,
}

static CRASH_HOOK: CrashHook = CrashHook {
    install: Mutex::new(()),
    dir: OnceLock::new(),
    writing: AtomicBool::new(false),
    sequence: AtomicU64::new(0),
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    /// Daily files kept on disk; 0 means the default.
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

/// Why a log or crash directory could not be used.
struct DirUnavailable {
    attempted: Option<PathBuf>,
    reason: String,
}

/// Create `<data_dir>/<parts..>`, reporting what was attempted on failure.
fn prepare_dir(
    purpose: &str,
    data_dir: Option<&Path>,
    parts: &[&str],
) -> Result<PathBuf, DirUnavailable> {
    let Some(data_dir) = data_dir else {
        return Err(DirUnavailable {
            attempted: None,
            reason: format!("{purpose} disabled: data_dir is not configured"),
        });
    };
    let dir = parts
        .iter()
        .fold(data_dir.to_path_buf(), |dir, part| dir.join(part));
    match fs::create_dir_all(&dir) {
        Ok(()) => Ok(dir),
        Err(error) => Err(DirUnavailable {
            reason: format!("failed to create {purpose} directory: {error}"),
            attempted: Some(dir),
        }),
    }
}

/// Pick the effective filter.
///
/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the
/// default. The noise filter is prepended only when the user did not
/// choose a filter on the command line.
pub fn compose_log_filter(options: &LoggingInitOptions) -> String {
    let explicit = match (options.cli_log_filter.as_deref(), options.verbose) {
        (Some(filter), _) => Some(filter.to_string()),
        (None, 0) => None,
        (None, 1) => Some("debug".to_string()),
        (None, _) => Some("trace".to_string()),
    };
    if let Some(filter) = explicit {
        return filter;
    }

    let base = options
        .rust_log_env
        .clone()
        .unwrap_or_else(|| options.default_log_filter.clone());
    match options.noise_filter.trim() {
        "" => base,
        noise => format!("{noise},{base}"),
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let log_dir = match prepare_dir("log", options.data_dir.as_deref(), &[DEFAULT_LOG_DIR_NAME]) {
        Ok(dir) => dir,
        Err(DirUnavailable { attempted, reason }) => {
            return FileSinkPlan::Fallback {
                attempted_log_dir: attempted,
                reason,
            }
        }
    };

    let retention = match options.retention_files {
        0 => DEFAULT_LOG_RETENTION_FILES,
        files => files,
    };
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&log_dir)
        .map_or_else(
            |error| FileSinkPlan::Fallback {
                attempted_log_dir: Some(log_dir.clone()),
                reason: format!("failed to initialize rolling file sink: {error}"),
            },
            |appender| FileSinkPlan::Ready {
                log_dir: log_dir.clone(),
                appender,
            },
        )
}

/// Install a process-wide hook that writes
/// `<data_dir>/logs/crash/panic-<timestamp>-<seq>.log` before chaining to
/// the previous hook. Installing twice is a no-op.
///
/// Panics caught further down (an inference engine panicking inside a
/// pipeline task, for instance) are recorded too, since the hook runs
/// before unwinding.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(crash_dir) = CRASH_HOOK.dir.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let crash_dir = match prepare_dir(
        "crash artifact",
        data_dir,
        &[DEFAULT_LOG_DIR_NAME, DEFAULT_CRASH_DIR_NAME],
    ) {
        Ok(dir) => dir,
        Err(DirUnavailable { attempted, reason }) => {
            return PanicHookInstallPlan::Fallback {
                attempted_crash_dir: attempted,
                reason,
            }
        }
    };

    let _guard = CRASH_HOOK
        .install
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = CRASH_HOOK.dir.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let chained = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_panic(&hook_dir, info);
        chained(info);
    }));

    let _ = CRASH_HOOK.dir.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

fn record_panic(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // Re-entrancy guard: a panic while writing must not loop.
    if CRASH_HOOK.writing.swap(true, Ordering::AcqRel) {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_into(crash_dir)
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook itself panicked while writing under '{}'.",
            crash_dir.display()
        ),
    }

    CRASH_HOOK.writing.store(false, Ordering::Release);
}

/// Everything persisted about one panic.
struct CrashReport {
    timestamp: DateTime<Utc>,
    thread: String,
    location: String,
    payload: String,
    backtrace_policy: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_policy, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured", backtrace.to_string()),
            BacktraceStatus::Disabled => (
                "disabled (set RUST_BACKTRACE=1 to enable)",
                "<disabled by backtrace policy>".to_string(),
            ),
            _ => ("unsupported", "<unavailable>".to_string()),
        };

        Self {
            timestamp: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info.location().map_or_else(
                || "<unknown>".to_string(),
                |l| format!("{}:{}:{}", l.file(), l.line(), l.column()),
            ),
            payload: payload_text(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }

    fn write_into(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let sequence = CRASH_HOOK.sequence.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "panic-{}-{sequence:06}.log",
            self.timestamp.format("%Y%m%d-%H%M%S-%f")
        ));

        let mut file = fs::File::create(&path)?;
        write!(
            file,
            "timestamp_utc={}\nversion={}\nthread={}\nlocation={}\npayload={}\nbacktrace_policy={}\nbacktrace:\n{}\n",
            self.timestamp.to_rfc3339(),
            env!("CARGO_PKG_VERSION"),
            self.thread,
            self.location,
            self.payload,
            self.backtrace_policy,
            self.backtrace,
        )?;
        file.flush()?;
        Ok(path)
    }
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
