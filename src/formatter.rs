use serde_json::Value;

use crate::record::{FormatArgs, LogEvent};
use crate::serializer::{dumps, FallbackFn, FieldValue, SerializeError};

/// Timestamp layout required by the ingestion schema: ISO-8601 UTC with
/// microsecond precision and a literal `Z` suffix.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Nested key holding the call-site location, as expected by the
/// Cloud Logging agent.
pub const SOURCE_LOCATION_KEY: &str = "logging.googleapis.com/sourceLocation";

/// Extras may never claim these, even on events where step 4 of the build
/// left them unset; keeps the output schema predictable.
const RESERVED_KEYS: [&str; 3] = ["exceptionType", "stackTrace", "stackInfo"];

/// Formats [`LogEvent`]s as single-line JSON suitable for Cloud Logging
/// (Stackdriver) ingestion, following the field layout documented at
/// <https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry>.
///
/// The formatter is stateless across calls apart from the optional
/// fallback hook fixed at construction; one instance may be shared
/// between threads.
#[derive(Clone, Default)]
pub struct StackdriverFormatter {
    fallback: Option<FallbackFn>,
}

impl StackdriverFormatter {
    pub fn new() -> Self {
        StackdriverFormatter { fallback: None }
    }

    /// Create a formatter with a hook that converts non-standard values
    /// (see [`FallbackFn`]) encountered anywhere in the record.
    pub fn with_fallback(fallback: FallbackFn) -> Self {
        StackdriverFormatter {
            fallback: Some(fallback),
        }
    }

    /// Whether formatting consumes the event's timestamp. Always true;
    /// there is no mode without the `time` field.
    pub fn uses_time(&self) -> bool {
        true
    }

    /// Render the event's creation time per [`DATE_FORMAT`].
    pub fn format_time(&self, event: &LogEvent) -> String {
        event.timestamp.format(DATE_FORMAT).to_string()
    }

    /// Format one event as a single-line JSON document.
    ///
    /// Base fields always win over caller-supplied extras; extras only
    /// exist when the event carries named arguments. On failure no line is
    /// produced and the error surfaces to the caller.
    pub fn format(&self, event: &LogEvent) -> Result<String, SerializeError> {
        let message = render_message(&event.message, &event.args);

        let mut record: Vec<(String, FieldValue)> = vec![
            ("severity".to_string(), event.severity.as_str().into()),
            ("time".to_string(), self.format_time(event).into()),
            ("message".to_string(), message.into()),
            ("logger".to_string(), event.logger.as_str().into()),
            ("module".to_string(), event.module.as_str().into()),
            (
                SOURCE_LOCATION_KEY.to_string(),
                FieldValue::Object(vec![
                    ("file".to_string(), event.file.as_str().into()),
                    ("line".to_string(), FieldValue::Json(Value::from(event.line))),
                    ("function".to_string(), event.function.as_str().into()),
                ]),
            ),
            (
                "process".to_string(),
                FieldValue::Object(vec![
                    ("name".to_string(), event.process_name.as_str().into()),
                    (
                        "id".to_string(),
                        FieldValue::Json(Value::from(event.process_id)),
                    ),
                ]),
            ),
            (
                "thread".to_string(),
                FieldValue::Object(vec![
                    ("name".to_string(), event.thread_name.as_str().into()),
                    (
                        "id".to_string(),
                        FieldValue::Json(Value::from(event.thread_id)),
                    ),
                ]),
            ),
        ];

        if let Some(exception) = &event.exception {
            record.push(("exceptionType".to_string(), exception.type_name().into()));
            // trace_text renders at most once and caches on the event.
            record.push(("stackTrace".to_string(), exception.trace_text().into()));
        }
        if let Some(stack) = &event.stack {
            record.push(("stackInfo".to_string(), stack.as_str().into()));
        }

        if let FormatArgs::Named(extras) = &event.args {
            for (key, value) in extras {
                let taken = RESERVED_KEYS.contains(&key.as_str())
                    || record.iter().any(|(existing, _)| existing == key);
                if taken {
                    continue;
                }
                record.push((key.clone(), value.clone()));
            }
        }

        dumps(&FieldValue::Object(record), self.fallback.as_ref())
    }
}

/// Fill the template's placeholders from `args`: `{}` consumes positional
/// values in order, `{name}` looks up a named value, `{{`/`}}` are literal
/// braces. Placeholders with no matching value are left verbatim.
fn render_message(template: &str, args: &FormatArgs) -> String {
    if matches!(args, FormatArgs::None) {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_positional = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    // Unterminated placeholder, keep as-is.
                    out.push('{');
                    out.push_str(&name);
                    continue;
                }
                match args {
                    FormatArgs::Positional(values) if name.is_empty() => {
                        if let Some(value) = values.get(next_positional) {
                            next_positional += 1;
                            out.push_str(&render_value(value));
                        } else {
                            out.push_str("{}");
                        }
                    }
                    FormatArgs::Named(map) if map.contains_key(&name) => {
                        if let Some(value) = map.get(&name) {
                            out.push_str(&value.to_string());
                        }
                    }
                    _ => {
                        out.push('{');
                        out.push_str(&name);
                        out.push('}');
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{epoch_seconds, ExceptionInfo, LogEvent, Severity};
    use crate::serializer::FieldValue;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn event(severity: Severity, message: &str) -> LogEvent {
        LogEvent {
            severity,
            timestamp: epoch_seconds(1609441956.123456),
            message: message.to_string(),
            args: FormatArgs::None,
            logger: "test_logger".to_string(),
            module: "orders".to_string(),
            file: "src/orders.rs".to_string(),
            line: 42,
            function: "submit".to_string(),
            process_name: "api-server".to_string(),
            process_id: 4242,
            thread_name: "main".to_string(),
            thread_id: 1,
            exception: None,
            stack: None,
        }
    }

    fn parse(line: &str) -> Value {
        serde_json::from_str(line).unwrap()
    }

    #[test]
    fn plain_info_event() {
        let out = StackdriverFormatter::new()
            .format(&event(Severity::Info, "hello world"))
            .unwrap();

        assert!(!out.contains('\n'));
        let payload = parse(&out);
        assert_eq!(payload["severity"], "INFO");
        assert_eq!(payload["time"], "2020-12-31T19:12:36.123456Z");
        assert_eq!(payload["message"], "hello world");
        assert_eq!(payload["logger"], "test_logger");
        assert_eq!(payload["module"], "orders");
        assert_eq!(payload[SOURCE_LOCATION_KEY]["file"], "src/orders.rs");
        assert_eq!(payload[SOURCE_LOCATION_KEY]["line"], 42);
        assert_eq!(payload[SOURCE_LOCATION_KEY]["function"], "submit");
        assert_eq!(payload["process"]["name"], "api-server");
        assert_eq!(payload["process"]["id"], 4242);
        assert_eq!(payload["thread"]["name"], "main");
        assert_eq!(payload["thread"]["id"], 1);
        assert!(payload.get("exceptionType").is_none());
        assert!(payload.get("stackTrace").is_none());
        assert!(payload.get("stackInfo").is_none());
    }

    #[test]
    fn schema_fields_keep_their_order() {
        let out = StackdriverFormatter::new()
            .format(&event(Severity::Info, "hello"))
            .unwrap();
        assert!(out.starts_with(r#"{"severity":"INFO","time":"#));
    }

    #[test]
    fn round_trip_has_exactly_the_base_fields() {
        let out = StackdriverFormatter::new()
            .format(&event(Severity::Info, "hello"))
            .unwrap();
        let payload = parse(&out);
        let keys: Vec<&str> = payload
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(
            keys,
            [
                "severity",
                "time",
                "message",
                "logger",
                "module",
                SOURCE_LOCATION_KEY,
                "process",
                "thread",
            ]
        );
    }

    #[test]
    fn named_args_substitute_and_merge_under_reserved_rules() {
        let mut ev = event(Severity::Info, "I have a data: {value}");
        let mut extras = BTreeMap::new();
        extras.insert("value".to_string(), FieldValue::from(99i64));
        extras.insert("module".to_string(), FieldValue::from("cannot override"));
        extras.insert("stackInfo".to_string(), FieldValue::from("cannot override"));
        ev.args = FormatArgs::Named(extras);

        let out = StackdriverFormatter::new().format(&ev).unwrap();
        assert!(!out.contains('\n'));
        let payload = parse(&out);
        assert_eq!(payload["message"], "I have a data: 99");
        assert_eq!(payload["value"], 99);
        assert_eq!(payload["module"], "orders");
        assert!(payload.get("stackInfo").is_none());
    }

    #[test]
    fn reserved_keys_are_dropped_even_when_unset() {
        let mut ev = event(Severity::Warning, "no exception here");
        let mut extras = BTreeMap::new();
        extras.insert("exceptionType".to_string(), FieldValue::from("Spoofed"));
        extras.insert("stackTrace".to_string(), FieldValue::from("spoofed"));
        extras.insert("requestId".to_string(), FieldValue::from("req-7"));
        ev.args = FormatArgs::Named(extras);

        let payload = parse(&StackdriverFormatter::new().format(&ev).unwrap());
        assert!(payload.get("exceptionType").is_none());
        assert!(payload.get("stackTrace").is_none());
        assert_eq!(payload["requestId"], "req-7");
    }

    #[test]
    fn positional_args_fill_placeholders_and_merge_nothing() {
        let mut ev = event(Severity::Debug, "retry {} of {}");
        ev.args = FormatArgs::Positional(vec![json!(2), json!(5)]);

        let payload = parse(&StackdriverFormatter::new().format(&ev).unwrap());
        assert_eq!(payload["message"], "retry 2 of 5");
        assert_eq!(payload.as_object().unwrap().len(), 8);
    }

    #[test]
    fn unknown_named_placeholder_is_left_verbatim() {
        let mut ev = event(Severity::Info, "{known} and {unknown} and {{literal}}");
        let mut extras = BTreeMap::new();
        extras.insert("known".to_string(), FieldValue::from("yes"));
        ev.args = FormatArgs::Named(extras);

        let payload = parse(&StackdriverFormatter::new().format(&ev).unwrap());
        assert_eq!(payload["message"], "yes and {unknown} and {literal}");
    }

    #[test]
    fn exception_adds_type_and_trace() {
        #[derive(Debug)]
        struct BrokerDown;
        impl std::fmt::Display for BrokerDown {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("broker unreachable")
            }
        }
        impl std::error::Error for BrokerDown {}

        let mut ev = event(Severity::Error, "An error occured!");
        ev.exception = Some(ExceptionInfo::from_error(&BrokerDown));

        let out = StackdriverFormatter::new().format(&ev).unwrap();
        assert!(!out.contains('\n'));
        let payload = parse(&out);
        assert_eq!(payload["severity"], "ERROR");
        assert_eq!(payload["exceptionType"], "BrokerDown");
        let trace = payload["stackTrace"].as_str().unwrap();
        assert!(trace.lines().last().unwrap().contains("broker unreachable"));
        assert!(payload.get("stackInfo").is_none());
    }

    #[test]
    fn prerendered_trace_text_is_used_verbatim() {
        let mut ev = event(Severity::Critical, "I have a custom exception");
        ev.exception = Some(ExceptionInfo::with_trace_text(
            "ValueError",
            "bad input",
            "frame a\nframe b\nValueError: bad input",
        ));

        let payload = parse(&StackdriverFormatter::new().format(&ev).unwrap());
        assert_eq!(payload["severity"], "CRITICAL");
        assert_eq!(payload["exceptionType"], "ValueError");
        assert_eq!(
            payload["stackTrace"],
            "frame a\nframe b\nValueError: bad input"
        );
    }

    #[test]
    fn stack_info_is_independent_of_exceptions() {
        let mut ev = event(Severity::Debug, "show stack info");
        ev.stack = Some("frame one\nframe two".to_string());

        let payload = parse(&StackdriverFormatter::new().format(&ev).unwrap());
        assert!(payload.get("exceptionType").is_none());
        assert!(payload.get("stackTrace").is_none());
        assert_eq!(payload["stackInfo"], "frame one\nframe two");
    }

    #[test]
    fn exception_and_stack_capture_may_both_appear() {
        let mut ev = event(Severity::Error, "both signals");
        ev.exception = Some(ExceptionInfo::new("TimeoutError", "deadline exceeded"));
        ev.stack = Some("captured elsewhere".to_string());

        let payload = parse(&StackdriverFormatter::new().format(&ev).unwrap());
        assert_eq!(payload["exceptionType"], "TimeoutError");
        assert!(payload["stackTrace"].as_str().unwrap().ends_with("TimeoutError: deadline exceeded"));
        assert_eq!(payload["stackInfo"], "captured elsewhere");
    }

    #[test]
    fn fallback_reaches_extra_values() {
        struct RequestId(u64);

        let mut ev = event(Severity::Info, "tagged");
        let mut extras = BTreeMap::new();
        extras.insert("request".to_string(), FieldValue::opaque(RequestId(7)));
        ev.args = FormatArgs::Named(extras);

        let fallback: FallbackFn = Arc::new(|opaque| {
            opaque
                .downcast_ref::<RequestId>()
                .map(|r| json!(format!("req-{}", r.0)))
        });

        let payload = parse(&StackdriverFormatter::with_fallback(fallback).format(&ev).unwrap());
        assert_eq!(payload["request"], "req-7");

        // Without the hook the same event fails, and no line is produced.
        assert!(StackdriverFormatter::new().format(&ev).is_err());
    }

    #[test]
    fn non_ascii_message_survives_unescaped() {
        let out = StackdriverFormatter::new()
            .format(&event(Severity::Info, "こんにちは"))
            .unwrap();
        assert!(out.contains("こんにちは"));
    }

    #[test]
    fn uses_time_is_always_true() {
        assert!(StackdriverFormatter::new().uses_time());
    }
}
