use crate::config::LogConfig;
use anyhow::{Context, Result};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking log writer alive for the process lifetime. Dropping
/// it flushes buffered output.
#[derive(Debug)]
pub struct LogGuards {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init_logging(config: &LogConfig, debug: bool) -> Result<LogGuards> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let default_directive = if debug { "debug" } else { config.filter.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let (layer, guard) = match &config.file {
        Some(path) => {
            let path = Path::new(path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("log.file has no file name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (build_layer(&config.format, writer), Some(guard))
        }
        None => (build_layer(&config.format, std::io::stderr), None),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .init();
    Ok(LogGuards { _file: guard })
}

fn build_layer<S, W>(format: &str, writer: W) -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber
        + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>
        + Send
        + Sync
        + 'static,
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    use tracing_subscriber::Layer;

    if format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .compact()
            .boxed()
    }
}
