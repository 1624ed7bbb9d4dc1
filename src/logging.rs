// Logging setup
//
// Every record carries the source location: `[LEVEL file:line] message`.
// RUST_LOG overrides the configured level.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fmt::Arguments;
use std::fs::OpenOptions;
use std::io::Write;

pub fn init(config: &LoggingConfig) -> Result<()> {
    let level = config.parse_level();
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level.unwrap_or(log::LevelFilter::Info))
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}",
                format_record(record.level(), record.file(), record.line(), record.args())
            )
        });

    if config.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.log_file)
            .with_context(|| format!("Failed to open log file: {:?}", config.log_file))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("Logger already initialized")?;
    if level.is_none() {
        log::warn!("Unknown log level '{}', defaulting to info", config.level);
    }
    Ok(())
}

fn format_record(
    level: log::Level,
    file: Option<&str>,
    line: Option<u32>,
    args: &Arguments<'_>,
) -> String {
    match (file, line) {
        (Some(file), Some(line)) => format!("[{} {}:{}] {}", level, file, line, args),
        (Some(file), None) => format!("[{} {}] {}", level, file, args),
        _ => format!("[{}] {}", level, args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_carries_location() {
        let line = format_record(
            log::Level::Warn,
            Some("src/app.rs"),
            Some(42),
            &format_args!("a {}", "test."),
        );
        assert_eq!(line, "[WARN src/app.rs:42] a test.");
    }

    #[test]
    fn record_without_location() {
        let line = format_record(log::Level::Debug, None, None, &format_args!("This"));
        assert_eq!(line, "[DEBUG] This");
    }
}
