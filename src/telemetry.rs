use std::env;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

fn env_filter(verbose: bool) -> EnvFilter {
    if let Ok(f) = EnvFilter::try_from_default_env() {
        return f;
    }
    let fallback = env::var("SANDTERM_LOG")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            if verbose {
                "sandterm=debug,info".to_string()
            } else {
                "info".to_string()
            }
        });
    EnvFilter::try_new(fallback).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn json_requested() -> bool {
    env::var("SANDTERM_LOG_FORMAT")
        .map(|v| v.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Install the process-wide subscriber once. Returns false when a subscriber was already
/// installed (by an earlier call or by the embedding application).
pub fn telemetry_init(verbose: bool) -> bool {
    let mut installed = false;
    INIT.get_or_init(|| {
        let filter = env_filter(verbose);
        let res = if json_requested() {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .try_init()
        };
        installed = res.is_ok();
    });
    installed
}
