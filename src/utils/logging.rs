//! Logging setup shared by the server and participant binaries

use clap::ValueEnum;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log level selectable on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

impl LogLevel {
    /// Level after applying `-v` repetitions, which override the flag
    pub fn with_verbosity(self, verbose_count: u8) -> Self {
        match verbose_count {
            0 => self,
            1 => LogLevel::Verbose,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn filter(self) -> &'static str {
        match self {
            LogLevel::Error => "mediaroom=error,tower_http=error",
            LogLevel::Warn => "mediaroom=warn,tower_http=warn",
            LogLevel::Info => "mediaroom=info,tower_http=info",
            LogLevel::Verbose => "mediaroom=debug,tower_http=info",
            LogLevel::Debug => "mediaroom=debug,tower_http=debug",
            LogLevel::Trace => "mediaroom=trace,tower_http=debug",
        }
    }
}

/// Initialize logging with tracing
///
/// `RUST_LOG` takes priority over the command line.
pub fn init_logging(level: LogLevel, verbose_count: u8) {
    let filter = level.with_verbosity(verbose_count).filter();
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
