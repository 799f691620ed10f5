use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

const DEFAULT_FILTER: &str = "offline_relay=info";

/// Install the global subscriber: stderr always, plus a daily rolling file
/// when `log.dir` is set. Keep the guard alive until exit or buffered lines
/// are lost.
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

  match &config.dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "offline-relay.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry().with(filter).with(stderr).init();
      None
    }
  }
}
