//! Source sanitization for untrusted candidate scripts.
//!
//! Generated scripts must be pure geometry-building code: the fixed preamble
//! supplies every allowed import, and nothing in a candidate may reach the
//! filesystem, environment, or network on its own. Sanitization strips
//! offending lines rather than rejecting the script; a script gutted down to
//! nothing still executes and fails with a normal interpreter diagnostic,
//! which feeds the fix loop like any other error.

use std::sync::LazyLock;

use regex::Regex;

/// Module accesses that can escape the geometry sandbox (`os.`, `sys.`, ...).
static BANNED_MODULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^A-Za-z0-9_])(?:os|sys|subprocess|shutil|socket|urllib|requests|importlib)\s*\.")
        .unwrap()
});

/// Builtins that evaluate or read arbitrary input.
static BANNED_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^A-Za-z0-9_.])(?:exec|eval|compile|open|input|__import__)\s*\(").unwrap()
});

fn line_is_banned(line: &str) -> bool {
    BANNED_MODULE_RE.is_match(line) || BANNED_CALL_RE.is_match(line)
}

/// Strip imports and non-geometry constructs from a candidate script.
pub fn sanitize_code(code: &str) -> String {
    let mut kept = Vec::new();
    for line in code.lines() {
        let stripped = line.trim_start();
        if stripped.starts_with("import ") || stripped.starts_with("from ") {
            continue;
        }
        if line_is_banned(line) {
            continue;
        }
        kept.push(line);
    }
    let mut out = kept.join("\n");
    if code.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Characters allowed in a parameter value supplied from outside
/// (numbers, arithmetic, short strings and tuples).
fn allowed_value_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            ' ' | '_' | '.' | '+' | '-' | '*' | '/' | '(' | ')' | '[' | ']' | ',' | '\'' | '"'
        )
}

/// Sanitize a parameter value before splicing it back into a script.
pub fn sanitize_param_value(value: &str) -> String {
    let cleaned: String = value.chars().filter(|c| allowed_value_char(*c)).collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() || line_is_banned(&cleaned) {
        return "0".to_string();
    }
    cleaned
}
