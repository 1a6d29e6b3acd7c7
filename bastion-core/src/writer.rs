//! Log routing.
//!
//! The `log` facade is pointed at `<log_dir>/core.log`, buffered so disk
//! writes stay off the copy path. An empty `log_dir` (or one that cannot
//! be created) leaves output on stderr. The filter comes from `RUST_LOG`
//! when set, otherwise from the configured level.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::Settings;

pub fn writer_start(settings: &Settings) {
    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| settings.log_level.clone());

    if settings.log_dir.is_empty() {
        let _ = builder(&filter).try_init();
        return;
    }

    match file_target(&settings.log_dir, &filter) {
        Ok(path) => log::info!("Logging to {}", path),
        Err(e) => {
            eprintln!("Failed to initialize file logging: {}", e);
            let _ = builder(&filter).try_init();
            log::warn!("Logging to stderr instead: {}", e);
        }
    }
}

fn file_target(dir: &str, filter: &str) -> Result<String, Box<dyn std::error::Error>> {
    let dir_path = Path::new(dir);
    if !dir_path.exists() {
        fs::create_dir_all(dir_path)?;
    }
    let path = dir_path.join("core.log");
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    let mut b = builder(filter);
    b.target(env_logger::Target::Pipe(Box::new(BufWriter::with_capacity(
        64 * 1024,
        file,
    ))));
    b.try_init()?;
    Ok(path.display().to_string())
}

fn builder(filter: &str) -> env_logger::Builder {
    let mut b = env_logger::Builder::new();
    b.format(|buf, record| {
        writeln!(
            buf,
            "[{}] {} [{}] {}",
            buf.timestamp(),
            record.level(),
            record.module_path().unwrap_or("core"),
            record.args()
        )
    });
    b.parse_filters(filter);
    b
}
