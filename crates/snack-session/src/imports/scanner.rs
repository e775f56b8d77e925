use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::SnackError;

/// Module specifier → version pinned by a trailing `// <semver>` comment,
/// or `None` when the import carries no pin.
pub type ModuleMap = BTreeMap<String, Option<String>>;

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*import\b\s*(?:[\w$*\s{},]+\bfrom\s*)?(['"])([^'"\n]+)(['"])"#).unwrap()
});

static EXPORT_FROM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*export\s+[\w$*\s{},]*\bfrom\s*(['"])([^'"\n]+)(['"])"#).unwrap()
});

static REQUIRE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\brequire\s*\(\s*(['"`])([^'"`\n]*)(['"`])\s*\)"#).unwrap());

static VERSION_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"//\s*([~^]?\d+(?:\.\d+){2}(?:[-+][\w.]+)?)\s*$").unwrap());

static IMPORT_LIKE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^\s*(?:import|export)\b|\brequire\s*\()").unwrap());

/// Scan `code` for static imports and single-literal requires, returning
/// specifier → optional pinned version. Relative and absolute specifiers
/// are excluded. Raises [`SnackError::Parse`] when the source cannot be
/// tokenized (unterminated block comment, template literal, or a string
/// left open on an import line) so the caller can skip the file.
pub fn scan(code: &str) -> Result<ModuleMap, SnackError> {
    let mut modules = ModuleMap::new();
    let mut lexer = LineLexer::default();

    for raw_line in code.split('\n') {
        let slice = lexer.next_line(raw_line);
        if slice.unterminated_string && IMPORT_LIKE_RE.is_match(&slice.code) {
            return Err(SnackError::Parse(
                "unterminated string literal on import line".into(),
            ));
        }
        let version = VERSION_COMMENT_RE
            .captures(raw_line)
            .map(|caps| caps[1].to_string());
        for specifier in line_specifiers(&slice.code) {
            modules.insert(specifier, version.clone());
        }
    }

    if lexer.in_block_comment {
        return Err(SnackError::Parse("unterminated block comment".into()));
    }
    if lexer.in_template {
        return Err(SnackError::Parse("unterminated template literal".into()));
    }
    Ok(modules)
}

/// Module specifiers on a single comment-stripped line, in source order.
pub(crate) fn line_specifiers(code: &str) -> Vec<String> {
    let mut specifiers = Vec::new();
    if let Some(caps) = IMPORT_RE.captures(code).or_else(|| EXPORT_FROM_RE.captures(code)) {
        if caps[1] == caps[3] {
            push_specifier(&mut specifiers, &caps[2]);
        }
    }
    for caps in REQUIRE_RE.captures_iter(code) {
        // Quotes must pair up, and template literals qualify only when
        // they hold a plain string: no interpolation, no newline.
        if caps[1] == caps[3] && !caps[2].contains("${") && !caps[2].is_empty() {
            push_specifier(&mut specifiers, &caps[2]);
        }
    }
    specifiers
}

fn push_specifier(out: &mut Vec<String>, specifier: &str) {
    if specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/') {
        return;
    }
    out.push(specifier.to_string());
}

/// Per-line view after stripping comments and multi-line constructs.
pub(crate) struct LineSlice {
    /// The portion of the line outside comments and template literals.
    pub code: String,
    pub unterminated_string: bool,
}

/// Tokenizer state carried across lines: block comments and template
/// literals span newlines; strings do not (a trailing `\` continuation is
/// tolerated).
#[derive(Default)]
pub(crate) struct LineLexer {
    pub in_block_comment: bool,
    pub in_template: bool,
}

impl LineLexer {
    pub fn next_line(&mut self, raw: &str) -> LineSlice {
        let mut code = String::with_capacity(raw.len());
        let mut unterminated_string = false;
        let bytes = raw.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if self.in_block_comment {
                match raw[i..].find("*/") {
                    Some(end) => {
                        self.in_block_comment = false;
                        i += end + 2;
                    }
                    None => return LineSlice { code, unterminated_string },
                }
                continue;
            }
            if self.in_template {
                match find_unescaped(raw, i, b'`') {
                    Some(end) => {
                        self.in_template = false;
                        i = end + 1;
                    }
                    None => return LineSlice { code, unterminated_string },
                }
                continue;
            }
            match bytes[i] {
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    self.in_block_comment = true;
                    i += 2;
                }
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    // Rest of the line is a comment; the version-pin
                    // extraction reads it from the raw line.
                    return LineSlice { code, unterminated_string };
                }
                quote @ (b'\'' | b'"') => {
                    code.push(quote as char);
                    match find_unescaped(raw, i + 1, quote) {
                        Some(end) => {
                            code.push_str(&raw[i + 1..=end]);
                            i = end + 1;
                        }
                        None => {
                            if !raw.ends_with('\\') {
                                unterminated_string = true;
                            }
                            code.push_str(&raw[i + 1..]);
                            return LineSlice { code, unterminated_string };
                        }
                    }
                }
                b'`' => {
                    code.push('`');
                    match find_unescaped(raw, i + 1, b'`') {
                        Some(end) => {
                            code.push_str(&raw[i + 1..=end]);
                            i = end + 1;
                        }
                        None => {
                            self.in_template = true;
                            return LineSlice { code, unterminated_string };
                        }
                    }
                }
                _ => {
                    let ch_len = utf8_len(bytes[i]);
                    code.push_str(&raw[i..i + ch_len]);
                    i += ch_len;
                }
            }
        }

        LineSlice { code, unterminated_string }
    }
}

fn find_unescaped(raw: &str, from: usize, target: u8) -> Option<usize> {
    let bytes = raw.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == target {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}
