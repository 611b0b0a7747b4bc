//! Tracing subscriber setup shared by the controller CLI and helper binaries.
//!
//! `RUST_LOG` wins when set. Otherwise `FILTERHOST_LOG` (`debug`, `info`,
//! `warn`, `error`) sets the level for the filterhost targets. `LOG_FORMAT=json`
//! switches to JSON lines.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Tracing targets are crate names: the library and the `filterhost` CLI
/// binary share `filterhost`.
const TARGETS: [&str; 2] = ["filterhost", "filterhost_builtin_helper"];

fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directives(level: &str) -> String {
    TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn build_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from(std::env::var("FILTERHOST_LOG").ok().as_deref());
        EnvFilter::new(filter_directives(level))
    }
}

fn init_with(writer: BoxMakeWriter, ansi: bool) {
    let filter = build_filter();
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    // A subscriber may already be installed (tests, embedding); keep it.
    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(writer))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(ansi).with_writer(writer))
            .try_init();
    }
}

/// Log to stderr.
pub fn init_tracing() {
    init_with(BoxMakeWriter::new(io::stderr), true);
}

/// Log to `path`, appending. Falls back to stderr if the file cannot be
/// opened, and returns the open error so the caller can mention it.
pub fn init_tracing_to_file(path: &Path) -> io::Result<()> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            init_with(BoxMakeWriter::new(Mutex::new(file)), false);
            Ok(())
        }
        Err(e) => {
            init_tracing();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(level_from(None), "info");
        assert_eq!(level_from(Some("debug")), "debug");
        assert_eq!(level_from(Some("warning")), "warn");
        assert_eq!(level_from(Some("loud")), "info");
    }

    #[test]
    fn directives_cover_every_binary() {
        assert_eq!(
            filter_directives("debug"),
            "filterhost=debug,filterhost_builtin_helper=debug"
        );
    }
}
