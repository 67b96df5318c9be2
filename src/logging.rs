use std::sync::{Once, OnceLock};

use slog::Drain;

fn parse_level(value: &str) -> log::LevelFilter {
    let lower = value.to_ascii_lowercase();
    if lower.contains("trace") {
        log::LevelFilter::Trace
    } else if lower.contains("debug") {
        log::LevelFilter::Debug
    } else if lower.contains("warn") {
        log::LevelFilter::Warn
    } else if lower.contains("error") {
        log::LevelFilter::Error
    } else if lower.contains("off") {
        log::LevelFilter::Off
    } else {
        log::LevelFilter::Info
    }
}

fn level_from_env_or_default(verbose: bool) -> log::LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(value) => parse_level(&value),
        Err(_) if verbose => log::LevelFilter::Debug,
        Err(_) => log::LevelFilter::Info,
    }
}

fn install_logger(logger: slog::Logger, level: log::LevelFilter) {
    static LOGGER_GUARD: OnceLock<slog_scope::GlobalLoggerGuard> = OnceLock::new();
    static STDLOG_INIT: Once = Once::new();

    if LOGGER_GUARD.get().is_none() {
        let guard = slog_scope::set_global_logger(logger);
        let _ = LOGGER_GUARD.set(guard);
    }

    STDLOG_INIT.call_once(|| {
        let _ = slog_stdlog::init();
    });
    log::set_max_level(level);
}

/// Colored compact logs on stderr for interactive commands.
pub fn init_terminal(verbose: bool) {
    let level = level_from_env_or_default(verbose);
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    let logger = slog::Logger::root(drain, slog::o!("proc" => "wgpanel"));
    install_logger(logger, level);
}

/// Plain logs on stderr for the helper. Its stdout carries protocol frames
/// only, and the broker relays these lines at debug level.
pub fn init_helper(verbose: bool) {
    let level = level_from_env_or_default(verbose);
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let logger = slog::Logger::root(drain, slog::o!("proc" => "wgpanel-helper"));
    install_logger(logger, level);
}
