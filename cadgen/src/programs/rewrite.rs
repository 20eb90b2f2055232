//! Export-statement canonicalization for candidate scripts.
//!
//! Candidates export their geometry in one of three shapes: a variable
//! holding the filename, a string literal passed straight to `export_stl`,
//! or no export at all (the last assignment is taken as the result). All
//! three are rewritten to the single canonical form
//!
//! ```text
//! filename = "render.stl"
//! export_stl(<object>, filename)
//! ```
//!
//! so the sandbox always knows where the artifact lands. This is deliberate
//! text-pattern matching, not parsing: the CAD scripting surface is neither
//! fully specified nor stable, and these three shapes are the contract.
//! Re-running any rewrite on its own output is a no-op.

use std::sync::LazyLock;

use regex::Regex;

/// `obj.export_stl(args)` method form, normalized to the function form.
static METHOD_EXPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)\.export_stl\(([^)]+)\)").unwrap());

/// Quoted `.stl` filename inside an `export_stl(...)` call.
static LITERAL_EXPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(["'])[^"']*\.stl(["'])"#).unwrap());

/// Existing tolerance argument, wherever it appears.
static TOLERANCE_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^(.*tolerance=)(\d+(?:\.\d+)?)(.*)$").unwrap());

/// An `export_stl(obj, name)` call missing a tolerance argument.
static EXPORT_CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(export_stl\(\s*[^,]+,\s*[^)]+)(\))").unwrap());

/// Canonical export call, used when rewriting to another format.
static CANONICAL_EXPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"export_stl\(\s*([\w.]+)\s*,\s*filename\s*\)").unwrap());

static TOLERANCE_ARG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*tolerance=\d+(?:\.\d+)?").unwrap());

/// Is this line a plain single-`=` assignment? Returns `(name, value)`.
fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = line.split('=').collect();
    if parts.len() != 2 {
        return None;
    }
    let name = parts[0].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name, parts[1].trim()))
}

fn is_stl_string(value: &str) -> bool {
    (value.starts_with('"') && value.ends_with(".stl\""))
        || (value.starts_with('\'') && value.ends_with(".stl'"))
}

/// Rewrite whatever export shape the candidate used to the canonical
/// filename variable plus `export_stl(<obj>, filename)` call.
pub fn canonicalize_export(code: &str, by: &str) -> String {
    let code = METHOD_EXPORT_RE.replace_all(code, "export_stl($1, $2)");
    let lines: Vec<&str> = code.lines().collect();

    // First shape: a variable assigned a quoted .stl name.
    let mut filename_var: Option<String> = None;
    let mut rewritten: Vec<String> = Vec::with_capacity(lines.len());
    for line in &lines {
        if filename_var.is_none()
            && let Some((name, value)) = split_assignment(line.trim())
            && is_stl_string(value)
        {
            filename_var = Some(name.to_string());
            rewritten.push(format!("filename = \"{by}\""));
            continue;
        }
        rewritten.push((*line).to_string());
    }

    if let Some(var) = filename_var {
        if var != "filename" {
            let var_re = Regex::new(&format!(r"\b{}\b", regex::escape(&var)))
                .expect("escaped identifier is a valid pattern");
            for line in &mut rewritten {
                if line.contains("export_stl(") {
                    *line = var_re.replace_all(line, "filename").into_owned();
                }
            }
        }
        return rewritten.join("\n");
    }

    // Second shape: a literal filename directly in the export call.
    let mut replaced = false;
    let mut with_literal: Vec<String> = Vec::with_capacity(lines.len());
    for line in &lines {
        if !replaced && line.contains("export_stl(") && LITERAL_EXPORT_RE.is_match(line) {
            with_literal.push(format!("filename = \"{by}\""));
            with_literal.push(LITERAL_EXPORT_RE.replace(line, "filename").into_owned());
            replaced = true;
            continue;
        }
        with_literal.push((*line).to_string());
    }
    if replaced {
        return with_literal.join("\n");
    }

    // Fallback: no export at all. Export whatever was assigned last.
    let mut out: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();
    let last_assigned = lines.iter().rev().find_map(|line| {
        split_assignment(line.trim()).and_then(|(name, value)| {
            (!value.starts_with('"') && !value.starts_with('\'')).then(|| name.to_string())
        })
    });
    if let Some(var) = last_assigned {
        out.push(format!("filename = \"{by}\""));
        out.push(format!("export_stl({var}, filename)"));
    }
    out.join("\n")
}

/// Force a fixed mesh tolerance on the export call, overwriting any
/// tolerance the candidate chose itself.
pub fn set_tolerance(code: &str, tolerance: u32) -> String {
    if code.contains(", tolerance=") {
        return TOLERANCE_VALUE_RE
            .replace(code, |caps: &regex::Captures<'_>| {
                format!("{}{}{}", &caps[1], tolerance, &caps[3])
            })
            .into_owned();
    }
    EXPORT_CALL_RE
        .replace_all(code, |caps: &regex::Captures<'_>| {
            format!("{}, tolerance={}{}", &caps[1], tolerance, &caps[2])
        })
        .into_owned()
}

/// Rewrite the canonical stl export to the equivalent call for another
/// format. Unknown formats leave the script untouched.
pub fn replace_export_format(code: &str, format: &str) -> String {
    let format = format.trim_start_matches('.');
    let func = match format {
        "stl" => return code.to_string(),
        "brep" => "export_brep",
        "step" => "export_step",
        "gltf" => "export_gltf",
        "3mf" => {
            let code = TOLERANCE_ARG_RE.replace_all(code, "");
            let code = code.replace("render.stl", "render.3mf");
            return CANONICAL_EXPORT_RE
                .replace(&code, "Mesher().add_shape($1)\nMesher().write(filename)")
                .into_owned();
        }
        _ => return code.to_string(),
    };

    let code = TOLERANCE_ARG_RE.replace_all(code, "");
    let code = code.replace("render.stl", &format!("render.{format}"));
    code.replace("export_stl(", &format!("{func}("))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "render.stl";

    #[test]
    fn rewrites_variable_held_filename() {
        let code = "result = make_part()\nout_name = \"cube.stl\"\nexport_stl(result, out_name)";
        let fixed = canonicalize_export(code, CANONICAL);
        assert_eq!(
            fixed,
            "result = make_part()\nfilename = \"render.stl\"\nexport_stl(result, filename)"
        );
    }

    #[test]
    fn rewrites_direct_literal() {
        let code = "result = make_part()\nexport_stl(result, 'cube.stl')";
        let fixed = canonicalize_export(code, CANONICAL);
        assert_eq!(
            fixed,
            "result = make_part()\nfilename = \"render.stl\"\nexport_stl(result, filename)"
        );
    }

    #[test]
    fn appends_export_for_bare_last_assignment() {
        let code = "part = Box(1, 2, 3)\nresult = part.fillet(0.5)";
        let fixed = canonicalize_export(code, CANONICAL);
        assert_eq!(
            fixed,
            "part = Box(1, 2, 3)\nresult = part.fillet(0.5)\nfilename = \"render.stl\"\nexport_stl(result, filename)"
        );
    }

    #[test]
    fn normalizes_method_call_export() {
        let code = "shape = Sphere(4)\nshape.export_stl(\"ball.stl\")";
        let fixed = canonicalize_export(code, CANONICAL);
        assert_eq!(
            fixed,
            "shape = Sphere(4)\nfilename = \"render.stl\"\nexport_stl(shape, filename)"
        );
    }

    #[test]
    fn canonicalizer_is_idempotent_on_all_shapes() {
        for code in [
            "out = \"a.stl\"\nexport_stl(result, out)",
            "export_stl(result, \"a.stl\")",
            "result = Box(1, 1, 1)",
        ] {
            let once = canonicalize_export(code, CANONICAL);
            let twice = canonicalize_export(&once, CANONICAL);
            assert_eq!(once, twice, "not idempotent for: {code}");
        }
    }

    #[test]
    fn injects_tolerance_when_missing() {
        let code = "export_stl(result, filename)";
        assert_eq!(set_tolerance(code, 5), "export_stl(result, filename, tolerance=5)");
    }

    #[test]
    fn overwrites_existing_tolerance() {
        let code = "export_stl(result, filename, tolerance=0.1)";
        let fixed = set_tolerance(code, 5);
        assert_eq!(fixed, "export_stl(result, filename, tolerance=5)");
        assert_eq!(set_tolerance(&fixed, 5), fixed);
    }

    #[test]
    fn replaces_export_format_for_step() {
        let code = "filename = \"render.stl\"\nexport_stl(result, filename, tolerance=5)";
        let fixed = replace_export_format(code, "step");
        assert_eq!(fixed, "filename = \"render.step\"\nexport_step(result, filename)");
    }

    #[test]
    fn replaces_export_format_for_3mf_mesher_form() {
        let code = "filename = \"render.stl\"\nexport_stl(result, filename, tolerance=5)";
        let fixed = replace_export_format(code, "3mf");
        assert_eq!(
            fixed,
            "filename = \"render.3mf\"\nMesher().add_shape(result)\nMesher().write(filename)"
        );
    }

    #[test]
    fn unknown_format_is_left_alone() {
        let code = "export_stl(result, filename)";
        assert_eq!(replace_export_format(code, "obj"), code);
    }
}
