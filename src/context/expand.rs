//! `{var}` substitution in key names and print statements.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Bound on substitution passes; a value that expands to another template
/// could otherwise cycle forever.
const MAX_EXPANSION_PASSES: usize = 32;

static INNERMOST_BRACES: OnceLock<Regex> = OnceLock::new();

fn innermost_braces() -> &'static Regex {
    INNERMOST_BRACES.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("brace pattern is valid"))
}

/// Replaces every `{name}` with `lookup(name)`, innermost templates first,
/// so `a{b{c}}` resolves `c`, then `b<c>`, then `a<…>`.
///
/// Unbalanced braces are left in place.
pub(crate) fn expand(text: &str, lookup: impl Fn(&str) -> String) -> String {
    if !text.contains('{') {
        return text.to_string();
    }
    let re = innermost_braces();
    let mut current = text.to_string();
    for _ in 0..MAX_EXPANSION_PASSES {
        let replaced = re.replace_all(&current, |caps: &Captures<'_>| lookup(&caps[1]));
        match replaced {
            Cow::Borrowed(_) => break,
            Cow::Owned(next) => current = next,
        }
    }
    current
}

/// Whether every `{` in `key` is closed by a later `}` and vice versa.
pub(crate) fn braces_balanced(key: &str) -> bool {
    let mut depth = 0usize;
    for c in key.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    depth == 0
}
