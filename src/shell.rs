//! Shell quoting and atom-name validation.
//!
//! Everything the control-plane sends to a remote host goes through a POSIX
//! shell, and most of it embeds caller-supplied text. [`quote`] produces a
//! single shell word that survives `/bin/sh -c` byte-for-byte; [`check_atom`]
//! is the only sanitisation applied to names that end up as Erlang atoms in
//! generated code.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ControlError;

/// Caller-supplied atom names must match this before they are embedded into
/// generated Erlang source.
static ATOM_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.:]*$").expect("atom name regex"));

/// Quote `s` as one POSIX single-quoted word.
///
/// The word reproduces `s` exactly once it has passed through `/bin/sh -c`:
/// the input is wrapped in single quotes and every internal `'` becomes the
/// four-character sequence `'\''`. No other transformation is applied.
pub fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Validate a caller-supplied atom name, returning it on success.
pub fn check_atom<'a>(name: &'a str) -> Result<&'a str, ControlError> {
    if ATOM_NAME.is_match(name) {
        Ok(name)
    } else {
        Err(ControlError::BadAtomName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_quoted(input: &str, expected: &str) {
        assert_eq!(quote(input), expected);
    }

    #[test]
    fn plain_words_are_wrapped() {
        assert_quoted("erl", "'erl'");
        assert_quoted("/usr/local/bin/elixir", "'/usr/local/bin/elixir'");
        assert_quoted("", "''");
        assert_quoted(" ", "' '");
    }

    #[test]
    fn single_quotes_are_spliced() {
        assert_quoted("it's", r"'it'\''s'");
        assert_quoted("''", r"''\'''\'''");
    }

    #[test]
    fn shell_metacharacters_are_inert() {
        assert_quoted("$(reboot)", "'$(reboot)'");
        assert_quoted("a;b|c&d", "'a;b|c&d'");
        assert_quoted("`ls` \"x\" \\n", "'`ls` \"x\" \\n'");
    }

    #[test]
    fn quoted_word_round_trips_through_sh() {
        // The property the rest of the crate relies on: sh -c "printf %s <q>"
        // reproduces the input byte-for-byte.
        for input in [
            "hello",
            "it's a 'test'",
            "$HOME `id` $(true) !history",
            "tabs\tand\nnewlines",
            "{ok, <<\"bin\">>}",
        ] {
            let out = std::process::Command::new("/bin/sh")
                .arg("-c")
                .arg(format!("printf %s {}", quote(input)))
                .output()
                .expect("run sh");
            assert_eq!(out.stdout, input.as_bytes(), "round-trip of {input:?}");
        }
    }

    #[test]
    fn atom_names_accept_module_like_identifiers() {
        for ok in ["kv_store", "Elixir.MyApp.Worker", "x", "_private", "io:format"] {
            assert!(check_atom(ok).is_ok(), "{ok} should validate");
        }
    }

    #[test]
    fn atom_names_reject_unsafe_input() {
        for bad in ["has space", "1starts_with_digit", "", "bad-dash", "a'b", "a\nb"] {
            assert!(
                matches!(check_atom(bad), Err(ControlError::BadAtomName(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
