use env_logger::Builder;
use log::Level;
use std::io::Write;

pub const LOG_ENV_VAR: &str = "AIRSIGN_LOG";

/// Initializes the global logger, reading filters from `AIRSIGN_LOG` and then
/// `RUST_LOG`, or using `default_filter` when neither is set.
///
/// # Errors
///
/// Fails if a global logger has already been installed.
pub fn try_init(default_filter: &str) -> Result<(), log::SetLoggerError> {
    let filter = [LOG_ENV_VAR, "RUST_LOG"]
        .iter()
        .find_map(|v| std::env::var(v).ok())
        .unwrap_or_else(|| default_filter.to_owned());
    let mut builder = formatted_builder();
    builder.parse_filters(&filter);
    builder.try_init()
}

// info lines are printed as plain text, everything else carries the level and the module
pub fn formatted_builder() -> Builder {
    let mut builder = Builder::new();

    builder.format(|f, record| {
        if record.level() == Level::Info {
            writeln!(f, " > {}", record.args())
        } else {
            let label = match record.level() {
                Level::Trace => "TRACE",
                Level::Debug => "DEBUG",
                Level::Info => "INFO ",
                Level::Warn => "WARN ",
                Level::Error => "ERROR",
            };
            let target = record
                .module_path()
                .and_then(|m| m.strip_prefix("airsign_core::"))
                .unwrap_or(record.target());
            writeln!(f, " {label} [{target}] > {}", record.args())
        }
    });

    builder
}
