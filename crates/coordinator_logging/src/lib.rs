//! Shared logging bootstrap for the coordinator binary.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "coordinator=info";

/// Logging configuration for the coordinator process.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub log_dir: PathBuf,
    pub verbose: bool,
}

/// Initialize tracing with a file writer plus a stderr layer.
///
/// The file layer always logs at `DEFAULT_LOG_FILTER` or whatever
/// `RUST_LOG` overrides it to; the stderr layer is quieted to `warn`
/// unless `verbose` is set, so stdout/stderr carry only the "minimal
/// startup/shutdown lines" the process surface calls for.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("failed to create log directory {}", config.log_dir.display()))?;

    let file_writer = SharedFileWriter::new(&config.log_dir, config.app_name)
        .context("failed to open log file")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        EnvFilter::new(DEFAULT_LOG_FILTER)
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .without_time()
                .with_target(false)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

struct SharedFileWriterInner {
    file: File,
}

impl Write for SharedFileWriterInner {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Single append-only log file shared across tracing layers.
///
/// The coordinator is a short-lived batch process, not a long-running
/// daemon, so there is no rotation scheme here — one file per run.
#[derive(Clone)]
struct SharedFileWriter {
    inner: Arc<Mutex<SharedFileWriterInner>>,
}

impl SharedFileWriter {
    fn new(dir: &std::path::Path, app_name: &str) -> io::Result<Self> {
        let path = dir.join(format!("{}.log", sanitize_name(app_name)));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(SharedFileWriterInner { file })),
        })
    }
}

struct SharedFileWriterGuard {
    inner: Arc<Mutex<SharedFileWriterInner>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedFileWriter {
    type Writer = SharedFileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedFileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
