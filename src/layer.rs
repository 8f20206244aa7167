use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::formatter::StackdriverFormatter;
use crate::record::{ExceptionInfo, FormatArgs, LogEvent, Severity};
use crate::serializer::{FallbackFn, FieldValue};

/// `tracing_subscriber` layer that turns every event into a [`LogEvent`]
/// and writes the formatted JSON line to a writer, stdout by default.
///
/// This is the boundary adapter: it owns all introspection (call-site
/// metadata, process and thread identity) so the formatter itself stays
/// decoupled from `tracing`.
pub struct StackdriverLayer {
    formatter: StackdriverFormatter,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl StackdriverLayer {
    /// Layer writing to stdout.
    pub fn new() -> Self {
        StackdriverLayer::with_writer(Box::new(io::stdout()))
    }

    /// Layer writing to an arbitrary writer; used by tests to capture
    /// output in memory.
    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        StackdriverLayer {
            formatter: StackdriverFormatter::new(),
            writer: Mutex::new(writer),
        }
    }

    /// Install a fallback hook for non-standard extra values.
    pub fn with_fallback(mut self, fallback: FallbackFn) -> Self {
        self.formatter = StackdriverFormatter::with_fallback(fallback);
        self
    }
}

impl Default for StackdriverLayer {
    fn default() -> Self {
        StackdriverLayer::new()
    }
}

impl From<Level> for Severity {
    fn from(level: Level) -> Self {
        match level {
            Level::TRACE | Level::DEBUG => Severity::Debug,
            Level::INFO => Severity::Info,
            Level::WARN => Severity::Warning,
            Level::ERROR => Severity::Error,
        }
    }
}

impl<S> Layer<S> for StackdriverLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event, _ctx: Context<'_, S>) {
        let mut fields = BTreeMap::new();
        let mut message: Option<String> = None;
        let mut exception: Option<ExceptionInfo> = None;

        let mut visitor = FieldVisitor {
            fields: &mut fields,
            message: &mut message,
            exception: &mut exception,
        };
        event.record(&mut visitor);

        let meta = event.metadata();
        let record = LogEvent {
            severity: Severity::from(*meta.level()),
            timestamp: Utc::now(),
            message: message.unwrap_or_default(),
            args: if fields.is_empty() {
                FormatArgs::None
            } else {
                FormatArgs::Named(fields)
            },
            logger: meta.target().to_string(),
            module: meta
                .module_path()
                .and_then(|p| p.rsplit("::").next())
                .unwrap_or("")
                .to_string(),
            file: meta.file().unwrap_or("").to_string(),
            line: meta.line().unwrap_or(0),
            // tracing has no function-name introspection; report the target.
            function: meta.target().to_string(),
            process_name: process_name().to_string(),
            process_id: std::process::id(),
            thread_name: std::thread::current().name().unwrap_or("").to_string(),
            thread_id: current_thread_id(),
            exception,
            stack: None,
        };

        match self.formatter.format(&record) {
            Ok(line) => {
                let mut writer = match self.writer.lock() {
                    Ok(writer) => writer,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let result = writer
                    .write_all(line.as_bytes())
                    .and_then(|()| writer.write_all(b"\n"));
                if let Err(e) = result {
                    eprintln!("error writing log line: {}", e);
                }
            }
            // The event line is dropped; a degraded diagnostic goes to
            // stderr so the failure stays visible.
            Err(e) => eprintln!("error formatting log record: {}", e),
        }
    }
}

/// Executable name, resolved once per process.
fn process_name() -> &'static str {
    static NAME: OnceLock<String> = OnceLock::new();
    NAME.get_or_init(|| {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string())
    })
}

/// Stable per-thread integer id. `std::thread::ThreadId::as_u64` is
/// unstable, so ids are handed out from a process-local counter.
fn current_thread_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

struct FieldVisitor<'a> {
    fields: &'a mut BTreeMap<String, FieldValue>,
    message: &'a mut Option<String>,
    exception: &'a mut Option<ExceptionInfo>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), value.into());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    /// The first error recorded on an event becomes its exception and
    /// produces the `exceptionType`/`stackTrace` output fields; any
    /// further error fields degrade to string extras.
    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        if self.exception.is_none() {
            *self.exception = Some(ExceptionInfo::from_dyn_error(value));
        } else {
            self.fields
                .insert(field.name().to_string(), value.to_string().into());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{:?}", value).into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_levels_map_to_severities() {
        assert_eq!(Severity::from(Level::TRACE), Severity::Debug);
        assert_eq!(Severity::from(Level::DEBUG), Severity::Debug);
        assert_eq!(Severity::from(Level::INFO), Severity::Info);
        assert_eq!(Severity::from(Level::WARN), Severity::Warning);
        assert_eq!(Severity::from(Level::ERROR), Severity::Error);
    }

    #[test]
    fn thread_ids_are_stable_within_a_thread() {
        assert_eq!(current_thread_id(), current_thread_id());
        let other = std::thread::spawn(current_thread_id)
            .join()
            .expect("join helper thread");
        assert_ne!(other, current_thread_id());
    }
}
