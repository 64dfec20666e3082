pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};
pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::Build;

/// Builds a terminal root logger writing to stderr at the supplied level.
pub fn term(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    builder.build().expect("Error building terminal logger")
}

/// Root logger that swallows all records. Components constructed without a
/// parent logger use this.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
