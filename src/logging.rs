//! Cluster-aware logging
//!
//! A deployment runs one metadata server per node and their logs usually
//! end up aggregated in one stream, so every line is tagged with the
//! node that produced it: the hostname plus the server index, as in
//! `[node07#2]`. Output is plain text with no ANSI escapes so files and
//! pipes stay readable.

use std::fmt;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Event formatter that tags every line with the originating node.
pub struct NodeFormatter {
    tag: String,
}

impl NodeFormatter {
    /// Tag lines with the hostname alone (clients, tools).
    pub fn new() -> Self {
        Self::for_server(None)
    }

    /// Tag lines with `hostname#server_id` (metadata servers).
    pub fn for_server(server_id: Option<u32>) -> Self {
        let host = gethostname::gethostname();
        let host = host.to_str().unwrap_or("unknown");
        let tag = match server_id {
            Some(id) => format!("{host}#{id}"),
            None => host.to_string(),
        };
        Self { tag }
    }
}

impl Default for NodeFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for NodeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");

        write!(
            writer,
            "{stamp} {:<5} [{}] {}: ",
            meta.level(),
            self.tag,
            meta.target()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            write!(writer, " ({file}:{line})")?;
        }
        writeln!(writer)
    }
}

/// Install the node-tagged subscriber. `RUST_LOG` overrides `level`.
pub fn init(level: &str, server_id: Option<u32>) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let format = NodeFormatter::for_server(server_id);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .event_format(format)
                .with_writer(std::io::stdout),
        )
        .init();

    tracing::info!("Logging initialized at level {}", level);
}
