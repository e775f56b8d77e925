use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::scanner::{self, LineLexer};

static TRAILING_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"//\s*[~^]?\d+(?:\.\d+){2}(?:[-+][\w.]+)?\s*$").unwrap());

static DIRECTIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*(['"])use [^'"]*(['"])\s*;?\s*$"#).unwrap());

/// Ensure every recognized import/require whose specifier appears in
/// `pins` carries a trailing `// <version>` comment matching the pin.
/// Divergent version comments are overwritten; unpinned lines and all
/// non-comment tokens are left byte-for-byte intact. Idempotent.
pub fn write(code: &str, pins: &BTreeMap<String, String>) -> String {
    let mut lexer = LineLexer::default();
    let mut out = Vec::new();

    for raw_line in code.split('\n') {
        let slice = lexer.next_line(raw_line);
        let pin = scanner::line_specifiers(&slice.code)
            .into_iter()
            .find_map(|specifier| pins.get(&specifier));
        match pin {
            Some(version) => out.push(pin_line(raw_line, version)),
            None => out.push(raw_line.to_string()),
        }
    }

    out.join("\n")
}

fn pin_line(raw_line: &str, version: &str) -> String {
    if let Some(found) = TRAILING_VERSION_RE.find(raw_line) {
        format!("{}// {version}", &raw_line[..found.start()])
    } else {
        format!("{} // {version}", raw_line.trim_end())
    }
}

/// Insert a bare `import '<module>';` after the leading directive
/// prologue unless some top-level import or require already names the
/// module. Idempotent.
pub fn insert(code: &str, module: &str) -> String {
    match scanner::scan(code) {
        Ok(modules) if modules.contains_key(module) => return code.to_string(),
        Ok(_) => {}
        // Unscannable source is left untouched; the caller already skips
        // such files.
        Err(_) => return code.to_string(),
    }

    let lines: Vec<&str> = code.split('\n').collect();
    let mut insert_at = 0;
    let mut lexer = LineLexer::default();
    for (index, raw_line) in lines.iter().enumerate() {
        let slice = lexer.next_line(raw_line);
        if raw_line.trim().is_empty() {
            continue;
        }
        // Comment-only lines (and lines swallowed by a block comment)
        // have an empty code slice.
        let is_prologue = (index == 0 && raw_line.starts_with("#!"))
            || slice.code.trim().is_empty()
            || DIRECTIVE_RE.is_match(&slice.code);
        if !is_prologue {
            break;
        }
        insert_at = index + 1;
    }

    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 1);
    out.extend(lines[..insert_at].iter().map(|line| line.to_string()));
    out.push(format!("import '{module}';"));
    out.extend(lines[insert_at..].iter().map(|line| line.to_string()));
    out.join("\n")
}
