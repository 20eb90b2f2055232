//! Parameter block extraction and substitution.
//!
//! Generated scripts declare their tunable parameters between
//! `# <parameters>` and `# </parameters>` comment markers, one
//! `name = literal-or-expression` per line. Extraction captures them as a
//! name → textual-value map; substitution rewrites the block in place from a
//! value map, preserving the block's own line order, so an extract-then-apply
//! round trip with unchanged values is byte-identical for plain
//! `name = literal` lines.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::programs::sanitize::sanitize_param_value;

static PARAMS_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)#\s*<parameters>\s*(.*?)\s*#\s*</parameters>").unwrap());

/// Parse one parameter line into `(name, value)`.
///
/// Lines without exactly one `=` are skipped; a trailing `#` comment is
/// stripped from the value.
fn parse_param_line(line: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = line.trim().split('=').collect();
    if parts.len() != 2 {
        return None;
    }
    let name = parts[0].trim();
    if name.is_empty() {
        return None;
    }
    let mut value = parts[1].trim();
    if let Some(idx) = value.find('#') {
        value = value[..idx].trim_end();
    }
    Some((name.to_string(), value.to_string()))
}

/// Extract the declared parameters of a script.
pub fn extract_params(code: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for caps in PARAMS_BLOCK_RE.captures_iter(code) {
        for line in caps[1].lines() {
            if let Some((name, value)) = parse_param_line(line) {
                params.insert(name, value);
            }
        }
    }
    params
}

/// Rewrite the parameter block from a value map.
///
/// Lines keep the block's order; names absent from the map keep their
/// current value. Substituted values are sanitized before splicing.
pub fn apply_params(code: &str, params: &BTreeMap<String, String>) -> String {
    PARAMS_BLOCK_RE
        .replace_all(code, |caps: &regex::Captures<'_>| {
            let mut updated = Vec::new();
            for line in caps[1].lines() {
                let Some((name, current)) = parse_param_line(line) else {
                    continue;
                };
                let value = match params.get(&name) {
                    Some(new_value) => sanitize_param_value(new_value),
                    None => current,
                };
                updated.push(format!("{name} = {value}"));
            }
            format!("# <parameters>\n{}\n# </parameters>", updated.join("\n"))
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "\
# <parameters>
radius = 10
height = 20
label = 'hub'
# </parameters>
part = Cylinder(radius, height)
";

    #[test]
    fn extracts_declared_parameters() {
        let params = extract_params(SCRIPT);
        assert_eq!(params.len(), 3);
        assert_eq!(params["radius"], "10");
        assert_eq!(params["height"], "20");
        assert_eq!(params["label"], "'hub'");
    }

    #[test]
    fn strips_trailing_comment_from_value() {
        let code = "# <parameters>\npitch = 5 # mm per turn\n# </parameters>\n";
        let params = extract_params(code);
        assert_eq!(params["pitch"], "5");
    }

    #[test]
    fn skips_lines_without_single_assignment() {
        let code = "# <parameters>\nradius = 10\nif a == b\nnoise\n# </parameters>\n";
        let params = extract_params(code);
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn extract_then_apply_is_byte_identical() {
        let params = extract_params(SCRIPT);
        assert_eq!(apply_params(SCRIPT, &params), SCRIPT);
    }

    #[test]
    fn apply_substitutes_new_values_in_block_order() {
        let mut params = extract_params(SCRIPT);
        params.insert("radius".to_string(), "42".to_string());
        let updated = apply_params(SCRIPT, &params);
        assert!(updated.contains("radius = 42\nheight = 20"));
    }

    #[test]
    fn apply_sanitizes_hostile_values() {
        let mut params = BTreeMap::new();
        params.insert("radius".to_string(), "__import__('os')".to_string());
        let code = "# <parameters>\nradius = 10\n# </parameters>\n";
        let updated = apply_params(code, &params);
        assert!(updated.contains("radius = 0"));
    }

    #[test]
    fn code_without_block_has_no_params() {
        assert!(extract_params("part = Box(1, 1, 1)\n").is_empty());
        let code = "part = Box(1, 1, 1)\n";
        assert_eq!(apply_params(code, &BTreeMap::new()), code);
    }
}
