//! Logger initialization

use log::LevelFilter;
use std::io::Write;

/// Initializes `env_logger` at `level`
///
/// When `RUST_LOG` is set it takes precedence, so per-module filters such as
/// `RUST_LOG=bridge_geo=debug,reqwest=info` still work. HTTP client internals
/// are capped at `Info` either way.
pub fn init_logger(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.filter_module("reqwest", LevelFilter::Info.min(level));
    builder.filter_module("hyper", LevelFilter::Info.min(level));

    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} {:<5} [{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    // try_init so a second call (tests) does not panic
    builder.try_init()
}
