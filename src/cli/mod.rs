/// CLI Indexes: pretrained models
pub mod models;

use log::LevelFilter;

/// Initialize console logging: `debug` when the experiment asks for it,
/// otherwise `info`. `RUST_LOG` takes precedence over both.
pub fn init_logging(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let _ = pretty_env_logger::formatted_builder()
        .filter_level(level)
        .parse_default_env()
        .try_init();
}
