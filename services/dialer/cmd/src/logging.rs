use std::fmt;
use std::fmt::Write as _;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths for alignment
const SERVICE_NAME_WIDTH: usize = 22;
const LOG_LEVEL_WIDTH: usize = 7;

/// Line formatter: `[timestamp] [service/component] [LEVEL] message key=value`
pub struct DialerLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl DialerLogFormatter {
    pub fn new(service_name: String) -> Self {
        Self {
            service_name,
            color_enabled: is_terminal(),
        }
    }

    #[cfg(test)]
    fn plain(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            color_enabled: false,
        }
    }

    /// Fixed-width `service/component` column
    fn format_service_name(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}/{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SERVICE_NAME_WIDTH {
            let truncated: String = name.chars().take(SERVICE_NAME_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SERVICE_NAME_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };

        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2)
    }

    fn get_color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn format_line(
        &self,
        timestamp: &str,
        level: &tracing::Level,
        target: &str,
        visitor: &FieldVisitor,
    ) -> String {
        let component = visitor
            .component
            .clone()
            .or_else(|| component_from_target(target));
        let color = self.get_color_for_level(level);
        let reset = if self.color_enabled { COLOR_RESET } else { "" };
        let cyan = if self.color_enabled { COLOR_CYAN } else { "" };

        let mut line = format!(
            "{}[{}] [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            self.format_service_name(component.as_deref()),
            color,
            self.format_log_level(level),
            reset,
            visitor.message
        );
        for (key, value) in &visitor.fields {
            let _ = write!(line, " {}={}", key, value);
        }
        line.push_str(reset);
        line
    }
}

impl<S, N> FormatEvent<S, N> for DialerLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        writeln!(
            writer,
            "{}",
            self.format_line(&timestamp, metadata.level(), metadata.target(), &visitor)
        )
    }
}

/// Last module path segment of a library target (`dialer_session::bridge` -> `bridge`)
fn component_from_target(target: &str) -> Option<String> {
    if !target.starts_with("dialer_") {
        return None;
    }
    target.rsplit("::").next().map(str::to_string)
}

/// Collects the message, the optional `component` and any other fields
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let text = format!("{:?}", value);
        let text = text
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(text);
        self.record_str(field, &text);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.fields.push((name, value.to_string())),
        }
    }
}

/// Whether stderr looks like a terminal that takes ANSI colors
fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visitor(message: &str, component: Option<&str>) -> FieldVisitor {
        FieldVisitor {
            message: message.to_string(),
            component: component.map(str::to_string),
            fields: Vec::new(),
        }
    }

    #[test]
    fn test_line_layout() {
        let formatter = DialerLogFormatter::plain("dialer");
        let mut fields = visitor("connection closed: EOF", None);
        fields.fields.push(("connection_id", "7".to_string()));

        let line = formatter.format_line(
            "2024-01-01 00:00:00.000",
            &tracing::Level::DEBUG,
            "dialer_session::connection",
            &fields,
        );
        assert!(line.starts_with("[2024-01-01 00:00:00.000] [dialer/connection"));
        assert!(line.contains("◦ DEBUG"));
        assert!(line.ends_with("connection closed: EOF connection_id=7"));
    }

    #[test]
    fn test_component_field_wins_over_target() {
        let formatter = DialerLogFormatter::plain("dialer");
        let line = formatter.format_line(
            "ts",
            &tracing::Level::INFO,
            "dialer_session::session",
            &visitor("hello", Some("forward")),
        );
        assert!(line.contains("[dialer/forward"));
    }

    #[test]
    fn test_foreign_targets_have_no_component() {
        assert_eq!(component_from_target("remote_dialer"), None);
        assert_eq!(component_from_target("hyper::proto"), None);
        assert_eq!(
            component_from_target("dialer_session::bridge"),
            Some("bridge".to_string())
        );
    }

    #[test]
    fn test_long_names_truncated() {
        let formatter = DialerLogFormatter::plain("dialer");
        let name = formatter.format_service_name(Some("a-really-long-component-name"));
        assert_eq!(name.chars().count(), SERVICE_NAME_WIDTH);
        assert!(name.ends_with('…'));
    }
}
