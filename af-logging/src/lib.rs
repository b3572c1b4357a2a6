//! Process-wide `tracing` setup for the workpool daemon.
//!
//! Everything is driven by `AF_LOG_*` environment variables:
//!
//! - `AF_LOG_LEVEL`: default filter when `RUST_LOG` is unset (`info`)
//! - `AF_LOG_OUTPUT`: `console`, `file` or `both`
//! - `AF_LOG_FORMAT`: `human` or `json`
//! - `AF_LOG_TAGS`: `key:value,...` span fields an event must be inside of;
//!   a value of `*` matches any value
//! - `AF_LOG_FILE_PATH`: file written when output includes `file`, rolled daily

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use tracing::subscriber::Interest;
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILE: &str = "/tmp/af-workpoold.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    /// Anything unrecognized: install filters but write nowhere.
    None,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "console" => Self::Console,
            "file" => Self::File,
            "both" => Self::Both,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub tags: Vec<Tag>,
    pub file_path: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            format: LogFormat::Human,
            tags: Vec::new(),
            file_path: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| env::var(name).ok();
        Self {
            level: var("AF_LOG_LEVEL").unwrap_or(defaults.level),
            output: var("AF_LOG_OUTPUT")
                .map(|v| LogOutput::parse(&v))
                .unwrap_or(defaults.output),
            format: match var("AF_LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Human,
            },
            tags: var("AF_LOG_TAGS").map(|v| parse_tags(&v)).unwrap_or_default(),
            file_path: var("AF_LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
        }
    }
}

/// Parse `key:value,key:value`. Entries without a colon are ignored.
pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

/// Drops events that are not inside spans carrying every configured tag.
pub struct TagFilterLayer {
    tags: Vec<Tag>,
}

impl TagFilterLayer {
    pub fn new(tags: Vec<Tag>) -> Self {
        Self { tags }
    }
}

type SpanFields = HashMap<String, String>;

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn register_callsite(&self, _meta: &'static Metadata<'static>) -> Interest {
        // Whether an event passes depends on the span it fires in.
        if self.tags.is_empty() {
            Interest::always()
        } else {
            Interest::sometimes()
        }
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = SpanFields::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(fields);
    }

    fn enabled(&self, meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.tags.is_empty() || !meta.is_event() {
            return true;
        }
        let Some(scope) = ctx.lookup_current().map(|span| span.scope()) else {
            return false;
        };

        let mut seen = SpanFields::new();
        for span in scope {
            if let Some(fields) = span.extensions().get::<SpanFields>() {
                for (key, value) in fields {
                    seen.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        self.tags.iter().all(|tag| {
            seen.get(&tag.key)
                .is_some_and(|value| tag.value == "*" || value.contains(&tag.value))
        })
    }
}

struct FieldVisitor<'a>(&'a mut SpanFields);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

/// Install the global subscriber. Keep the returned guard alive for as long
/// as file logging should be flushed.
pub fn init_subscriber(settings: &LogSettings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},sqlx=warn,hyper=warn,reqwest=warn",
            settings.level
        ))
    });

    let mut guard = None;
    let mut file_writer = || {
        let dir = settings
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = settings
            .file_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "af-workpoold.log".into());
        let (writer, file_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
        guard = Some(file_guard);
        writer
    };

    let writer = match settings.output {
        LogOutput::Console => Some(BoxMakeWriter::new(std::io::stdout)),
        LogOutput::File => Some(BoxMakeWriter::new(file_writer())),
        LogOutput::Both => Some(BoxMakeWriter::new(std::io::stdout.and(file_writer()))),
        LogOutput::None => None,
    };

    let fmt_layer = writer.map(|writer| {
        let layer = tracing_subscriber::fmt::layer().with_writer(writer);
        match settings.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Human => layer.pretty().boxed(),
        }
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(TagFilterLayer::new(settings.tags.clone()))
        .with(fmt_layer)
        .try_init();
    if let Err(e) = installed {
        eprintln!("Logging already initialized: {}", e);
    }
    guard
}

/// [`init_subscriber`] with settings from the environment.
pub fn init_from_env() -> Option<WorkerGuard> {
    init_subscriber(&LogSettings::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_tags() {
        assert_eq!(
            parse_tags("workpool:abc, capture:*,broken,:empty"),
            vec![
                Tag {
                    key: "workpool".to_string(),
                    value: "abc".to_string()
                },
                Tag {
                    key: "capture".to_string(),
                    value: "*".to_string()
                },
            ]
        );
        assert!(parse_tags("").is_empty());
    }

    #[test]
    fn test_output_parsing() {
        assert_eq!(LogOutput::parse("Both"), LogOutput::Both);
        assert_eq!(LogOutput::parse(" file "), LogOutput::File);
        assert_eq!(LogOutput::parse("syslog"), LogOutput::None);
    }

    struct CountEvents(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for CountEvents {
        fn on_event(&self, _event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_tag_filter_keeps_only_tagged_spans() {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry()
            .with(TagFilterLayer::new(parse_tags("capture:41")))
            .with(CountEvents(count.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("outside any span");
            tracing::info_span!("capture", capture = 41_i64).in_scope(|| {
                tracing::info!("inside the tagged span");
                tracing::info_span!("phase", name = "mount").in_scope(|| {
                    tracing::info!("inside a child span");
                });
            });
            tracing::info_span!("capture", capture = 7_i64).in_scope(|| {
                tracing::info!("inside another capture");
            });
        });

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
