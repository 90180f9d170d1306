use std::fmt;
use std::thread;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::BenchConfig;

pub(crate) const LOG_ENV: &str = "RDMA_BENCH_LOG";

fn level_colour(level: &Level) -> Colour {
    match *level {
        Level::ERROR => Colour::Red,
        Level::WARN => Colour::Yellow,
        Level::INFO => Colour::Green,
        Level::DEBUG => Colour::Blue,
        Level::TRACE => Colour::Purple,
    }
}

/// `[time LEVEL role] message`. The role is the name of the emitting thread, so that both ends
/// of a loopback run can be told apart in one stream.
struct BenchFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for BenchFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = event.metadata().level();
        let text = format!("{:>5}", level.as_str());
        let level = if self.ansi && writer.has_ansi_escapes() {
            level_colour(level).paint(text).to_string()
        } else {
            text
        };
        let current = thread::current();

        write!(
            writer,
            "[{} {} {}] ",
            chrono::Local::now().format("%H:%M:%S%.6f"),
            level,
            current.name().unwrap_or("bench"),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber. The level comes from `RDMA_BENCH_LOG`, falling back to the
/// configured one. Records of the `log` facade are forwarded as well.
pub(crate) fn init_log(config: &BenchConfig, ansi: bool) -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::builder()
        .with_default_directive(config.log_level.parse()?)
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(ansi)
        .event_format(BenchFormatter { ansi })
        .with_filter(filter);

    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}
