//! Thin facade over `slog` so downstream crates get a single logging import.
//! Long lived objects take `Into<Option<&Logger>>` in their constructors and
//! hold a child logger; passing `None` wires up a discard logger for tests.

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default terminal logger.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Default logger config must parse");

    config.build_logger().expect("Default logger must build")
}

/// Builds a logger from a sloggers TOML snippet.
pub fn init_from_toml(toml: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).map_err(|err| err.to_string())?;
    config.build_logger().map_err(|err| err.to_string())
}

/// Resolves the optional parent logger into a child or discard logger.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        _ => Logger::root(Discard, o!()),
    }
}
