use std::io::Write;
use std::sync::Once;

use chrono::Local;
use log::LevelFilter;

static INIT: Once = Once::new();

/// Installs the process logger once. `RUST_LOG` overrides `level`.
pub fn init(level: LevelFilter) {
    INIT.call_once(|| {
        let result = env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] {}: {}",
                    Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .try_init();

        // Another logger may already be installed by the embedding application.
        if let Err(e) = result {
            eprintln!("Failed to initialize logger: {}", e);
        }
    });
}
