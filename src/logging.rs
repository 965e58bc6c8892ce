//! Subscriber setup for the `blockfile` binary.  Library code only emits
//! events; it never installs a subscriber.
//!
//! Filter priority, highest first:
//!
//! 1. `BLOCKFILE_LOG` (directives, e.g. `blockfile::recovery=debug,warn`)
//! 2. `RUST_LOG`
//! 3. `-v` (debug for this crate, warn elsewhere) / `-q` (error)
//! 4. `warn`

use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "BLOCKFILE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    /// Verbose wins when both flags are given.
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    pub const fn default_level(self) -> Level {
        match self {
            Self::Quiet   => Level::ERROR,
            Self::Normal  => Level::WARN,
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Install the global fmt subscriber on stderr.  A second call is a no-op.
pub fn init(verbosity: Verbosity) {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(verbosity == Verbosity::Verbose)
        .with_thread_names(verbosity == Verbosity::Verbose);

    let _ = tracing_subscriber::registry()
        .with(env_filter(verbosity))
        .with(fmt_layer)
        .try_init();
}

fn env_filter(verbosity: Verbosity) -> EnvFilter {
    if let Some(filter) = std::env::var(LOG_ENV).ok().and_then(|d| EnvFilter::try_new(d).ok()) {
        return filter;
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(default_directive(verbosity))
}

fn default_directive(verbosity: Verbosity) -> String {
    match verbosity {
        Verbosity::Verbose => format!("{},{}=debug", Level::WARN, env!("CARGO_CRATE_NAME")),
        other              => other.default_level().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_verbosity() {
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Verbose);
    }

    #[test]
    fn default_directives() {
        assert_eq!(default_directive(Verbosity::Normal), "WARN");
        assert_eq!(default_directive(Verbosity::Quiet), "ERROR");
        assert_eq!(default_directive(Verbosity::Verbose), "WARN,blockfile=debug");
    }
}
