//! Dedicated failure log
//!
//! Every request that ends in a 500 is reported twice: once through
//! `tracing`, and once here, as a plain-text record appended to a file:
//!
//! ```text
//! --- failure at unix 1760000000.123 ---
//! type: MissingFieldError
//! value: layer 1 activations is missing field 'attn_weights'
//! backtrace:
//! ...
//! ```
//!
//! For an error the backtrace is taken where the record is written, since
//! error values carry no trace of their own. For a panic it is the panic
//! site, kept by the hook [`install_panic_hook`] sets up.
//!
//! Writes never fail the request. If the file cannot be written the problem
//! is reported through `tracing` and the response goes out regardless.

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    error::Error as _,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Once, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
};
use tower_http::catch_panic::ResponseForPanic;

use crate::error::{MiradorError, Result};

/// Failure type recorded for handler panics
pub const PANIC_KIND: &str = "Panic";

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a panic hook that keeps the panic-site backtrace for the next
/// record made on the panicking thread
///
/// Installs once per process; the previous hook still runs.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

/// Backtrace of the latest panic on this thread, if the hook kept one
#[must_use]
pub fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

/// Append-only failure record file
#[derive(Debug)]
pub struct FailureLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FailureLog {
    /// Open (creating if needed) `path` for appending
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// Log file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record for a failed request
    pub fn record(&self, err: &MiradorError) {
        self.record_with_trace(err, None);
    }

    /// Append a record, using `trace` instead of the current stack when the
    /// failure's origin is known
    pub fn record_with_trace(&self, err: &MiradorError, trace: Option<String>) {
        let mut value = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            value.push_str("\ncaused by: ");
            value.push_str(&cause.to_string());
            source = cause.source();
        }
        self.append(err.kind(), &value, trace);
    }

    /// Append a record for a handler panic on the current thread
    pub fn record_panic(&self, message: &str) {
        self.append(PANIC_KIND, message, take_panic_trace());
    }

    /// Flush and close the file; later records are dropped
    pub fn close(&self) {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut file) = guard.take() {
            if let Err(e) = file.flush() {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to flush failure log"
                );
            }
        }
    }

    fn append(&self, kind: &str, value: &str, trace: Option<String>) {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let record = format!(
            "--- failure at unix {stamp:.3} ---\ntype: {kind}\nvalue: {value}\nbacktrace:\n{}\n\n",
            trace.unwrap_or_else(|| Backtrace::force_capture().to_string())
        );

        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(file) = guard.as_mut() else {
            tracing::warn!(kind, "failure log closed, record dropped");
            return;
        };
        if let Err(e) = file.write_all(record.as_bytes()).and_then(|()| file.flush()) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write failure log");
        }
    }
}

/// Turns a handler panic into a logged 500 whose body is the panic message
#[derive(Debug, Clone)]
pub struct PanicResponder {
    log: Arc<FailureLog>,
}

impl PanicResponder {
    /// Responder recording into `log`
    #[must_use]
    pub fn new(log: Arc<FailureLog>) -> Self {
        Self { log }
    }
}

/// Text carried by a panic payload
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "handler panicked".to_string()
    }
}

impl ResponseForPanic for PanicResponder {
    type ResponseBody = Body;

    fn response_for_panic(&mut self, err: Box<dyn Any + Send + 'static>) -> Response<Body> {
        let message = panic_message(err.as_ref());
        tracing::error!(kind = PANIC_KIND, error = %message, "request handler panicked");
        self.log.record_panic(&message);

        let mut response = Response::new(Body::from(message));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(log: &FailureLog) -> String {
        std::fs::read_to_string(log.path()).unwrap()
    }

    #[test]
    fn test_record_writes_type_value_and_trace() {
        let dir = tempfile::tempdir().unwrap();
        let log = FailureLog::open(dir.path().join("failures.log")).unwrap();
        log.record(&MiradorError::UnsupportedType {
            type_name: "PRNGKey".to_string(),
        });

        let text = read(&log);
        assert!(text.contains("type: UnsupportedTypeError"));
        assert!(text.contains("value: Object of type PRNGKey is not JSON serializable"));
        assert!(text.contains("backtrace:"));
    }

    #[test]
    fn test_panic_hook_keeps_panic_site() {
        install_panic_hook();
        let _ = take_panic_trace();

        let caught = std::panic::catch_unwind(|| panic!("tensor on fire"));
        assert!(caught.is_err());
        let trace = take_panic_trace().unwrap();
        assert!(trace.contains("panicking"));
        assert!(take_panic_trace().is_none());

        let dir = tempfile::tempdir().unwrap();
        let log = FailureLog::open(dir.path().join("f.log")).unwrap();
        log.record_with_trace(&MiradorError::Inference("x".into()), Some("frame 0: origin".into()));
        assert!(read(&log).contains("backtrace:\nframe 0: origin\n"));
    }

    #[test]
    fn test_records_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.log");
        std::fs::write(&path, "earlier\n").unwrap();

        let log = FailureLog::open(&path).unwrap();
        log.record(&MiradorError::SpreadUnavailable);
        log.record_panic("boom");

        let text = read(&log);
        assert!(text.starts_with("earlier\n"));
        assert_eq!(text.matches("--- failure at unix").count(), 2);
        assert!(text.contains("type: Panic\nvalue: boom"));
    }

    #[test]
    fn test_source_chain_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let log = FailureLog::open(dir.path().join("f.log")).unwrap();
        log.record(&MiradorError::Bind {
            addr: "127.0.0.1:1".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address taken"),
        });
        assert!(read(&log).contains("caused by: address taken"));
    }

    #[test]
    fn test_closed_log_drops_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = FailureLog::open(dir.path().join("f.log")).unwrap();
        log.close();
        log.record(&MiradorError::SpreadUnavailable);
        assert!(read(&log).is_empty());
    }

    #[test]
    fn test_open_fails_for_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FailureLog::open(dir.path().join("nope").join("f.log")).is_err());
    }

    #[test]
    fn test_panic_responder() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(FailureLog::open(dir.path().join("f.log")).unwrap());
        let mut responder = PanicResponder::new(Arc::clone(&log));

        let response = responder.response_for_panic(Box::new("layer exploded"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(read(&log).contains("value: layer exploded"));
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&42u8), "handler panicked");
    }
}
