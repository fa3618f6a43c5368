//! Thin facade over `slog`/`sloggers` so the rest of the crate (and binaries
//! built on it) share one logging surface.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Builds the default terminal logger. Binaries call this once and hand out
/// child loggers via `log.new(o!())`.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
    )
    .unwrap();

    config.build_logger().unwrap()
}

/// Resolves an optional parent logger into a usable one, discarding output
/// when no parent was supplied. Constructors take `Into<Option<&Logger>>` and
/// run their choice through here.
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}
