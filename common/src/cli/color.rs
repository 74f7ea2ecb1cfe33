//! Color policy shared by the sender, receiver and benchmark binaries.
//!
//! Precedence, highest first:
//! - An explicit `--color always|never`.
//! - `NO_COLOR` set, or running under `EMACS`: no color.
//! - `Auto`: color only when the stream is a TTY.

use std::env;
use std::fmt;
use std::str::FromStr;

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorWhen {
    /// Enable colors only when output is a TTY.
    #[default]
    Auto,

    /// Always enable colors.
    Always,

    /// Never enable colors.
    Never,
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used for the given stream.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => !env_disables_color() && atty::is(stream),
        }
    }

    /// Convenience helper for stdout.
    pub fn should_color_stdout(self) -> bool {
        self.should_color(atty::Stream::Stdout)
    }

    /// Convenience helper for stderr.
    pub fn should_color_stderr(self) -> bool {
        self.should_color(atty::Stream::Stderr)
    }
}

fn env_disables_color() -> bool {
    env::var_os("NO_COLOR").is_some() || env::var_os("EMACS").is_some()
}

impl FromStr for ColorWhen {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ColorWhen::Auto),
            "always" => Ok(ColorWhen::Always),
            "never" => Ok(ColorWhen::Never),
            other => Err(format!("invalid color choice '{other}' (auto|always|never)")),
        }
    }
}

impl fmt::Display for ColorWhen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ColorWhen::Auto => "auto",
            ColorWhen::Always => "always",
            ColorWhen::Never => "never",
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn with_env_var<K: AsRef<str>, V: AsRef<str>, F: FnOnce()>(key: K, val: V, f: F) {
        // ---
        let key = key.as_ref();
        let prev = env::var_os(key);
        env::set_var(key, val.as_ref());
        f();
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn no_color_disables_in_auto() {
        // ---
        with_env_var("NO_COLOR", "1", || {
            assert!(!ColorWhen::Auto.should_color_stdout());
            assert!(!ColorWhen::Auto.should_color_stderr());
        });
    }

    #[test]
    fn emacs_disables_in_auto() {
        // ---
        with_env_var("EMACS", "t", || {
            assert!(!ColorWhen::Auto.should_color_stdout());
            assert!(!ColorWhen::Auto.should_color_stderr());
        });
    }

    #[test]
    fn explicit_always_wins() {
        // ---
        with_env_var("NO_COLOR", "1", || {
            assert!(ColorWhen::Always.should_color_stdout());
        });
    }

    #[test]
    fn parses_and_displays_choices() {
        // ---
        for choice in [ColorWhen::Auto, ColorWhen::Always, ColorWhen::Never] {
            assert_eq!(choice.to_string().parse::<ColorWhen>(), Ok(choice));
        }
        assert!("sometimes".parse::<ColorWhen>().is_err());
    }

    #[test]
    fn explicit_never_wins() {
        // ---
        with_env_var("NO_COLOR", "", || {
            assert!(!ColorWhen::Never.should_color_stdout());
        });
    }
}
