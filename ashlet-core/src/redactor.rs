//! Rewrites a shell command line to hide sensitive variable references and
//! assignment values, per §4.1. Parses with `tree-sitter-bash` (the same
//! grammar this codebase uses elsewhere for command introspection); any
//! parse error falls back to a three-pass `regex-lite` rewrite that covers
//! the same three patterns.

use std::sync::LazyLock;

use regex_lite::Regex;
use tree_sitter::Parser;

const SENTINEL: &str = "REDACTED";

const SAFE_VAR_NAMES: &[&str] = &[
    "HOME",
    "USER",
    "PWD",
    "OLDPWD",
    "SHELL",
    "PATH",
    "LANG",
    "TERM",
    "EDITOR",
    "PAGER",
    "HOSTNAME",
    "LOGNAME",
    "TMPDIR",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "XDG_RUNTIME_DIR",
    "DISPLAY",
    "WAYLAND_DISPLAY",
    "HISTFILE",
    "HISTSIZE",
    "SHLVL",
    "COLUMNS",
    "LINES",
    "LC_ALL",
    "LC_CTYPE",
];

/// `true` for names on the allow-list or the single-character shell special
/// parameters (`?`, `!`, `#`, `@`, `*`, `-`, `$`, `_`, digits 0-9).
pub fn is_safe_name(name: &str) -> bool {
    if name.len() == 1 {
        let c = name.as_bytes()[0];
        if matches!(c, b'?' | b'!' | b'#' | b'@' | b'*' | b'-' | b'$' | b'_') || c.is_ascii_digit()
        {
            return true;
        }
    }
    if name.chars().all(|c| c.is_ascii_digit()) && !name.is_empty() {
        return true;
    }
    SAFE_VAR_NAMES.contains(&name)
}

/// Redact a single shell command line. Idempotent: `redact(redact(x)) ==
/// redact(x)` for every `x`, since a redacted reference/assignment is always
/// safe (`$REDACTED` and `NAME=***`) and is therefore left untouched on a
/// second pass.
pub fn redact(command: &str) -> String {
    match try_redact_with_tree(command) {
        Some(redacted) => redacted,
        None => redact_with_regex(command),
    }
}

fn try_redact_with_tree(command: &str) -> Option<String> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_bash::LANGUAGE.into())
        .ok()?;
    let tree = parser.parse(command, None)?;
    if tree.root_node().has_error() {
        return None;
    }

    let mut spans: Vec<(usize, usize, String)> = Vec::new();
    collect_redaction_spans(tree.root_node(), command, &mut spans);
    if spans.is_empty() {
        return Some(command.to_string());
    }

    spans.sort_by_key(|(start, _, _)| *start);
    let mut out = String::with_capacity(command.len());
    let mut cursor = 0usize;
    for (start, end, replacement) in spans {
        if start < cursor {
            // Overlapping span from a nested match; skip it defensively.
            continue;
        }
        out.push_str(&command[cursor..start]);
        out.push_str(&replacement);
        cursor = end;
    }
    out.push_str(&command[cursor..]);
    Some(out)
}

/// Walk the parse tree collecting `(start_byte, end_byte, replacement)`
/// spans. Single-quoted strings (`raw_string`) never contain expansion
/// nodes in this grammar, so they are preserved automatically just by not
/// producing any spans inside them.
fn collect_redaction_spans(node: tree_sitter::Node, src: &str, out: &mut Vec<(usize, usize, String)>) {
    match node.kind() {
        "variable_assignment" => {
            let text = node_text(node, src);
            if let Some(eq) = text.find('=') {
                let name = &text[..eq];
                if is_valid_name(name) && !is_safe_name(name) {
                    out.push((node.start_byte(), node.end_byte(), format!("{name}=***")));
                    return;
                }
            }
            // Safe (or unparseable) name: still walk the value for nested
            // variable references, e.g. `SAFE_VAR=$SECRET_TOKEN`.
            recurse(node, src, out);
        }
        "simple_expansion" => {
            let text = node_text(node, src);
            if let Some(name) = text.strip_prefix('$') {
                if !is_safe_name(name) {
                    out.push((node.start_byte(), node.end_byte(), format!("${SENTINEL}")));
                }
            }
        }
        "expansion" => {
            let text = node_text(node, src);
            if let Some(inner) = text.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
                let name_len = inner
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(inner.len());
                let name = &inner[..name_len];
                if is_valid_name(name) && !is_safe_name(name) {
                    if name_len == inner.len() {
                        out.push((node.start_byte(), node.end_byte(), format!("${{{SENTINEL}}}")));
                    } else {
                        let name_start = node.start_byte() + 2;
                        out.push((name_start, name_start + name_len, SENTINEL.to_string()));
                    }
                }
            }
        }
        _ => recurse(node, src, out),
    }
}

fn recurse(node: tree_sitter::Node, src: &str, out: &mut Vec<(usize, usize, String)>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_redaction_spans(child, src, out);
    }
}

fn node_text<'a>(node: tree_sitter::Node, src: &'a str) -> &'a str {
    node.utf8_text(src.as_bytes()).unwrap_or("")
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

static RE_BRACED_EXPANSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));
static RE_SIMPLE_EXPANSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"));
static RE_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(^|[\s;&|])(export\s+)?([A-Za-z_][A-Za-z0-9_]*)=(\S*)").expect("valid regex")
});

/// Regex fallback used when the shell-syntax parse fails. Tracks single/
/// double-quote state with a simple scan so references inside single quotes
/// are left untouched, matching the tree-based pass's behavior.
fn redact_with_regex(command: &str) -> String {
    let segments = split_on_single_quotes(command);
    let mut out = String::with_capacity(command.len());
    for (text, is_single_quoted) in segments {
        if is_single_quoted {
            out.push_str(text);
            continue;
        }
        let mut s = RE_BRACED_EXPANSION
            .replace_all(text, |caps: &regex_lite::Captures| {
                if is_safe_name(&caps[1]) {
                    caps[0].to_string()
                } else {
                    format!("${{{SENTINEL}}}")
                }
            })
            .into_owned();
        s = RE_SIMPLE_EXPANSION
            .replace_all(&s, |caps: &regex_lite::Captures| {
                if is_safe_name(&caps[1]) {
                    caps[0].to_string()
                } else {
                    format!("${SENTINEL}")
                }
            })
            .into_owned();
        s = RE_ASSIGNMENT
            .replace_all(&s, |caps: &regex_lite::Captures| {
                let name = &caps[3];
                if is_safe_name(name) {
                    caps[0].to_string()
                } else {
                    format!("{}{}{}=***", &caps[1], caps.get(2).map(|m| m.as_str()).unwrap_or(""), name)
                }
            })
            .into_owned();
        out.push_str(&s);
    }
    out
}

/// Split `s` into alternating (text, is_single_quoted) segments on
/// unescaped single quotes.
fn split_on_single_quotes(s: &str) -> Vec<(&str, bool)> {
    let mut segments = Vec::new();
    let bytes = s.as_bytes();
    let mut start = 0usize;
    let mut in_quote = false;
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            i += 2;
            continue;
        }
        if bytes[i] == b'\'' {
            segments.push((&s[start..i], in_quote));
            start = i + 1;
            in_quote = !in_quote;
        }
        i += 1;
    }
    segments.push((&s[start..], in_quote));
    segments
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn redacts_unsafe_simple_expansion() {
        assert_eq!(
            redact("curl -H $SECRET_TOKEN http://x"),
            "curl -H $REDACTED http://x"
        );
    }

    #[test]
    fn redacts_unsafe_assignment() {
        assert_eq!(redact("export API_KEY=hunter2"), "export API_KEY=***");
    }

    #[test]
    fn leaves_safe_variable_untouched() {
        assert_eq!(redact("cd $HOME/projects"), "cd $HOME/projects");
    }

    #[test]
    fn leaves_single_quoted_reference_literal() {
        assert_eq!(
            redact("echo '$SECRET_TOKEN'"),
            "echo '$SECRET_TOKEN'"
        );
    }

    #[test]
    fn redacts_reference_inside_double_quotes() {
        assert_eq!(redact("echo \"$SECRET_TOKEN\""), "echo \"$REDACTED\"");
    }

    #[test]
    fn redacts_braced_expansion() {
        assert_eq!(redact("echo ${SECRET_TOKEN}"), "echo ${REDACTED}");
    }

    #[test]
    fn is_idempotent() {
        let inputs = [
            "curl -H $SECRET_TOKEN http://x",
            "export API_KEY=hunter2",
            "cd $HOME/projects",
            "echo '$SECRET_TOKEN'",
            "echo \"$SECRET_TOKEN and $HOME\"",
        ];
        for input in inputs {
            let once = redact(input);
            let twice = redact(&once);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn special_parameters_are_safe() {
        assert_eq!(redact("echo $? $! $# $@ $* $- $$ $_ $1"), "echo $? $! $# $@ $* $- $$ $_ $1");
    }

    #[test]
    fn regex_fallback_matches_tree_semantics() {
        assert_eq!(
            redact_with_regex("curl -H $SECRET_TOKEN http://x"),
            "curl -H $REDACTED http://x"
        );
        assert_eq!(
            redact_with_regex("export API_KEY=hunter2"),
            "export API_KEY=***"
        );
        assert_eq!(redact_with_regex("cd $HOME/projects"), "cd $HOME/projects");
    }
}
