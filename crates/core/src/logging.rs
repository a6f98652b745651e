use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "DRIVEPROGRESS_LOG";
pub const LOG_DIR_ENV: &str = "DRIVEPROGRESS_LOG_DIR";

static SESSION_LOG: OnceLock<SessionLog> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug)]
struct SessionLog {
    writer: Mutex<Option<BufWriter<std::fs::File>>>,
}

impl SessionLog {
    fn new() -> Self {
        Self {
            writer: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<std::fs::File>>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start(&self, path: &Path) -> std::io::Result<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "session log already active",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *guard = Some(BufWriter::new(file));
        Ok(())
    }

    fn finish(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Writes into the active session log file, or nowhere when none is open.
pub struct SessionLogWriter<'a> {
    guard: MutexGuard<'a, Option<BufWriter<std::fs::File>>>,
}

impl Write for SessionLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.guard.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.guard.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SessionLog {
    type Writer = SessionLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SessionLogWriter { guard: self.lock() }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &SessionLog {
    type Writer = SessionLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(
    driveprogress_log: Option<&str>,
    rust_log: Option<&str>,
    configured: Option<&str>,
) -> EnvFilter {
    let default = || EnvFilter::new("info");

    for v in [driveprogress_log, rust_log, configured].into_iter().flatten() {
        if let Ok(filter) = EnvFilter::try_new(v) {
            return filter;
        }
    }
    default()
}

fn build_env_filter(configured: Option<&str>) -> EnvFilter {
    build_env_filter_from(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
        configured,
    )
}

/// Installs the global subscriber: JSON lines on stderr, plus the session log
/// file once [`start_session_log`] has opened one. Later calls are no-ops.
pub fn init_logging(configured_filter: Option<&str>) {
    TRACING_INIT.get_or_init(|| {
        let session = SESSION_LOG.get_or_init(SessionLog::new);

        let stderr_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(std::io::stderr)
            .boxed();
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(session)
            .boxed();

        let subscriber = tracing_subscriber::registry()
            .with(build_env_filter(configured_filter))
            .with(stderr_layer)
            .with(file_layer);
        let _ = subscriber.try_init();
    });
}

pub struct SessionLogGuard {
    path: PathBuf,
}

impl SessionLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLogGuard {
    fn drop(&mut self) {
        if let Some(log) = SESSION_LOG.get() {
            let _ = log.finish();
        }
    }
}

/// Opens `<log_dir>/<kind>-<utc timestamp>.ndjson` and mirrors every log line
/// into it until the guard is dropped.
pub fn start_session_log(kind: &str, data_dir: &Path) -> std::io::Result<SessionLogGuard> {
    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_name = format!(
        "{}-{}-{}.ndjson",
        sanitize_filename_component(kind),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        std::process::id()
    );
    let path = log_dir.join(file_name);

    SESSION_LOG.get_or_init(SessionLog::new).start(&path)?;
    Ok(SessionLogGuard { path })
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    if let Ok(v) = std::env::var(LOG_DIR_ENV) {
        return PathBuf::from(v);
    }
    data_dir.join("logs")
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_precedence_is_app_then_rust_log_then_config_then_default() {
        let f1 = build_env_filter_from(Some("info"), Some("debug"), Some("warn"));
        let f2 = build_env_filter_from(None, Some("warn"), Some("error"));
        let f3 = build_env_filter_from(None, None, Some("error"));
        let f4 = build_env_filter_from(None, None, None);

        assert_eq!(f1.to_string(), "info");
        assert_eq!(f2.to_string(), "warn");
        assert_eq!(f3.to_string(), "error");
        assert_eq!(f4.to_string(), "info");
    }

    #[test]
    fn invalid_directive_falls_through() {
        let f = build_env_filter_from(Some("driveprogress=verbose"), None, Some("warn"));
        assert_eq!(f.to_string(), "warn");
    }

    #[test]
    fn sanitizes_file_name_components() {
        assert_eq!(sanitize_filename_component("daemon/1 a"), "daemon_1_a");
    }

    #[test]
    fn session_log_is_ndjson_and_flushed_on_drop() {
        init_logging(Some("debug"));
        let temp = tempfile::tempdir().expect("create tempdir");
        let guard = start_session_log("test", temp.path()).expect("start_session_log");
        assert_eq!(
            guard.path().parent(),
            Some(temp.path().join("logs").as_path())
        );

        tracing::info!(event = "session.start", "session.start");
        tracing::warn!(event = "protocol.decode_failed", error = "x", "protocol.decode_failed");

        let path = guard.path().to_path_buf();
        drop(guard);

        let text = std::fs::read_to_string(&path).expect("read session log");
        assert!(!text.trim().is_empty(), "session log is empty");
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            let obj = v.as_object().expect("json object");
            assert!(obj.contains_key("timestamp"));
            assert!(obj.contains_key("level"));
            assert!(obj.contains_key("fields"));
        }
    }
}
