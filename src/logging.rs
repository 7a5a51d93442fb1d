//! Structured logging setup.
//!
//! A terminal decorator, `slog-envlogger` for `RUST_LOG`-style filtering,
//! `slog-async` to keep logging off the connection hot path, and
//! `slog-stdlog` so crates that log via the `log` facade (e.g. `actix-web`'s
//! own middleware) still end up in the same sink.

use slog::{o, Drain};
use slog_scope::GlobalLoggerGuard;

/// Initializes the global `slog` logger.
///
/// The returned guard must be kept alive for the process lifetime; dropping
/// it restores the previous (no-op) global logger.
///
/// # Panics
///
/// If `slog_stdlog` has already been initialized by someone else.
#[must_use]
pub fn init() -> GlobalLoggerGuard {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = slog::Logger::root(drain, o!());

    let guard = slog_scope::set_global_logger(logger);
    slog_stdlog::init().expect("slog_stdlog::init must only be called once");
    guard
}
