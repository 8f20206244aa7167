use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::OnceLock;

use crate::serializer::FieldValue;

/// Log level of an event, rendered uppercase in the output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substitution values attached to a log call.
///
/// The two shapes are distinct at the type level: positional values only
/// fill `{}` placeholders and are never merged into the output object,
/// while named values fill `{name}` placeholders and double as extra
/// fields subject to the formatter's reserved-key rules.
#[derive(Debug, Clone, Default)]
pub enum FormatArgs {
    #[default]
    None,
    Positional(Vec<serde_json::Value>),
    Named(BTreeMap<String, FieldValue>),
}

/// Exception attached to a log event: type name, message, optional cause
/// chain, and the rendered traceback text.
///
/// Rendering the traceback can be expensive, so it happens at most once;
/// the result is cached for any downstream consumer of the event.
#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    type_name: String,
    message: String,
    causes: Vec<String>,
    rendered: OnceLock<String>,
}

impl ExceptionInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        ExceptionInfo {
            type_name: type_name.into(),
            message: message.into(),
            causes: Vec::new(),
            rendered: OnceLock::new(),
        }
    }

    /// Capture a concrete error, including its `source()` chain. The type
    /// name is the error type's unqualified name.
    pub fn from_error<E: Error>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let type_name = full.rsplit("::").next().unwrap_or(full);

        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        ExceptionInfo {
            type_name: type_name.to_string(),
            message: err.to_string(),
            causes,
            rendered: OnceLock::new(),
        }
    }

    /// Capture a type-erased error, as handed out by framework hooks that
    /// only expose `&dyn Error`. The concrete type name is unavailable
    /// through the trait object; it is recovered from the error's Debug
    /// rendering, which for derived impls starts with the type's name.
    pub fn from_dyn_error(err: &(dyn Error + 'static)) -> Self {
        let debug = format!("{:?}", err);
        let name: String = debug
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        let type_name = if name.is_empty() {
            "Error".to_string()
        } else {
            name
        };

        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        ExceptionInfo {
            type_name,
            message: err.to_string(),
            causes,
            rendered: OnceLock::new(),
        }
    }

    /// Build from traceback text the framework has already rendered, so the
    /// formatter will not render it again.
    pub fn with_trace_text(
        type_name: impl Into<String>,
        message: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let info = ExceptionInfo::new(type_name, message);
        let _ = info.rendered.set(text.into());
        info
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Traceback text; rendered on first access and cached. The last line
    /// is always `<type>: <message>`.
    pub fn trace_text(&self) -> &str {
        self.rendered.get_or_init(|| {
            let mut out = String::from("error trace (most recent cause last):");
            for cause in self.causes.iter().rev() {
                out.push_str("\n  caused by: ");
                out.push_str(cause);
            }
            out.push('\n');
            out.push_str(&self.type_name);
            out.push_str(": ");
            out.push_str(&self.message);
            out
        })
    }
}

/// One structured log occurrence, constructed by an adapter at the system
/// boundary and consumed read-only by the formatter.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    /// Message template; placeholders are filled from `args`.
    pub message: String,
    pub args: FormatArgs,
    pub logger: String,
    pub module: String,
    pub file: String,
    pub line: u32,
    pub function: String,
    pub process_name: String,
    pub process_id: u32,
    pub thread_name: String,
    pub thread_id: u64,
    pub exception: Option<ExceptionInfo>,
    /// Pre-formatted stack capture, independent of `exception`.
    pub stack: Option<String>,
}

/// Convert floating-point seconds since the Unix epoch to UTC, rounded to
/// microsecond precision. Out-of-range inputs clamp to the epoch.
pub fn epoch_seconds(secs: f64) -> DateTime<Utc> {
    let micros = (secs * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}
