use env_logger::{Builder, Target};
use log::LevelFilter;

/// Log to stderr; stdout belongs to the `ready` handshake. `RUST_LOG`
/// overrides the level picked from `-v`.
pub fn init(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };

    let _ = Builder::new()
        .target(Target::Stderr)
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .try_init();
}
