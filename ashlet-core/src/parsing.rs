//! Pure text-processing functions behind the Completion Orchestrator (§4.6):
//! chain separators, the quote-content filter, tagged/fallback reply
//! parsing, confidence assignment, and the quote-aware re-rank.

use regex_lite::Regex;
use std::sync::LazyLock;

use crate::protocol::Candidate;

const CURSOR_SENTINEL: char = '█';

/// `sep` inserted between `input` and an appended candidate's text.
pub fn chain_separator(input: &str) -> &'static str {
    let trimmed_end = input.trim_end_matches(' ');
    if trimmed_end.ends_with("&&") || trimmed_end.ends_with("||") || trimmed_end.ends_with('|') || trimmed_end.ends_with(';') {
        if input.ends_with(' ') {
            ""
        } else {
            " "
        }
    } else {
        " && "
    }
}

/// Replaces the content of every matched quote pair (single or double, with
/// backslash-escape awareness) with nothing, keeping the quote characters
/// themselves.
pub fn quote_content_filter(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'"' || c == b'\'' {
            let quote = c;
            out.push(quote as char);
            let mut j = i + 1;
            let mut closed_at = None;
            while j < bytes.len() {
                if bytes[j] == b'\\' && j + 1 < bytes.len() {
                    j += 2;
                    continue;
                }
                if bytes[j] == quote {
                    closed_at = Some(j);
                    break;
                }
                j += 1;
            }
            match closed_at {
                Some(close) => {
                    out.push(quote as char);
                    i = close + 1;
                }
                None => {
                    out.push_str(&s[i + 1..]);
                    i = bytes.len();
                }
            }
        } else {
            let ch_len = utf8_char_len(c);
            out.push_str(&s[i..i + ch_len]);
            i += ch_len;
        }
    }
    out
}

fn utf8_char_len(first_byte: u8) -> usize {
    if first_byte & 0x80 == 0 {
        1
    } else if first_byte & 0xE0 == 0xC0 {
        2
    } else if first_byte & 0xF0 == 0xE0 {
        3
    } else {
        4
    }
}

/// Quote-content-filters a list of history commands, preserving order, then
/// deduplicates by exact string.
pub fn filter_and_dedup_history(commands: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for command in commands {
        let filtered = quote_content_filter(command);
        if seen.insert(filtered.clone()) {
            out.push(filtered);
        }
    }
    out
}

static CANDIDATE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<candidate\s+type="(replace|append)">(.*?)</candidate>"#).expect("valid regex")
});
static COMMAND_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<command>(.*?)</command>").expect("valid regex"));

struct ParsedBlock {
    kind: String,
    concatenation: String,
    marker_offset: Option<usize>,
}

fn parse_blocks(reply: &str) -> Vec<ParsedBlock> {
    CANDIDATE_BLOCK
        .captures_iter(reply)
        .map(|caps| {
            let kind = caps[1].to_string();
            let inner = &caps[2];
            let commands: Vec<&str> = COMMAND_TAG.captures_iter(inner).map(|c| c.get(1).unwrap().as_str()).collect();

            let mut concatenation = String::new();
            let mut marker_offset = None;
            for (idx, raw) in commands.iter().enumerate() {
                if idx > 0 {
                    concatenation.push_str(" && ");
                }
                let start = concatenation.len();
                if marker_offset.is_none() {
                    if let Some(pos) = raw.find(CURSOR_SENTINEL) {
                        marker_offset = Some(start + pos);
                        concatenation.push_str(&raw.replacen(CURSOR_SENTINEL, "", 1));
                        continue;
                    }
                }
                concatenation.push_str(raw);
            }

            ParsedBlock { kind, concatenation, marker_offset }
        })
        .collect()
}

/// Collapses repeated spaces and trims `s`, adjusting `offset` (a byte
/// index into `s`) to its position in the result. `offset` beyond the
/// string's end clamps to the trimmed length.
fn collapse_and_trim_with_offset(s: &str, offset: Option<usize>) -> (String, Option<usize>) {
    let target = offset.unwrap_or(usize::MAX);
    let mut collapsed = String::with_capacity(s.len());
    let mut last_was_space = false;
    let mut byte_pos = 0usize;
    let mut out_pos = 0usize;
    let mut mapped = None;

    for c in s.chars() {
        if byte_pos == target {
            mapped = Some(out_pos);
        }
        let is_space = c == ' ';
        let keep = !(is_space && last_was_space);
        if keep {
            collapsed.push(c);
            out_pos += c.len_utf8();
        }
        last_was_space = is_space;
        byte_pos += c.len_utf8();
    }
    if byte_pos == target {
        mapped = Some(out_pos);
    }
    if offset.is_some() && mapped.is_none() {
        mapped = Some(out_pos);
    }

    let trimmed_start_len = collapsed.len() - collapsed.trim_start_matches(' ').len();
    let trimmed = collapsed.trim().to_string();
    let final_offset = mapped.map(|o| o.saturating_sub(trimmed_start_len).min(trimmed.len()));
    (trimmed, final_offset)
}

/// Tagged-block parsing (§4.6 "Candidate parsing"). Returns completions in
/// reply order, already collapsed/trimmed/deduplicated, capped at
/// `max_candidates`.
pub fn parse_tagged_candidates(reply: &str, input: &str, max_candidates: usize) -> Vec<(String, Option<usize>)> {
    let sep = chain_separator(input);
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for block in parse_blocks(reply) {
        if out.len() >= max_candidates {
            break;
        }
        let (completion, offset) = if block.kind == "append" {
            let full = format!("{input}{sep}{}", block.concatenation);
            let shifted = block.marker_offset.map(|m| m + input.len() + sep.len());
            (full, shifted)
        } else {
            (block.concatenation, block.marker_offset)
        };

        let (final_completion, final_offset) = collapse_and_trim_with_offset(&completion, offset);
        if final_completion.is_empty() {
            continue;
        }
        if seen.insert(final_completion.clone()) {
            out.push((final_completion, final_offset));
        }
    }
    out
}

/// Line-based fallback used when no tagged blocks are present.
pub fn fallback_parse(reply: &str, input: &str, max_candidates: usize) -> Vec<(String, Option<usize>)> {
    let input_first_token = input.split_whitespace().next();
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for line in reply.lines() {
        if out.len() >= max_candidates {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("$ ") || trimmed.starts_with('<') {
            continue;
        }
        let stripped = strip_surrounding_backticks(trimmed);
        let candidate_first_token = stripped.split_whitespace().next();
        let accept = match input_first_token {
            None => true,
            Some(tok) => candidate_first_token == Some(tok),
        };
        if !accept {
            continue;
        }
        let collapsed = crate::util::collapse_spaces(stripped);
        if collapsed.is_empty() {
            continue;
        }
        if seen.insert(collapsed.clone()) {
            out.push((collapsed, None));
        }
    }
    out
}

fn strip_surrounding_backticks(s: &str) -> &str {
    s.strip_prefix('`').and_then(|r| r.strip_suffix('`')).unwrap_or(s)
}

/// `max(0.10, 0.95 - 0.15 * position)`.
pub fn confidence_at(position: usize) -> f64 {
    (0.95 - 0.15 * position as f64).max(0.10)
}

/// Returns `(open_idx, close_idx)` of every backslash-escape-aware matched
/// quote pair in `s`, in order.
fn quote_pairs(s: &str) -> Vec<(usize, usize)> {
    let bytes = s.as_bytes();
    let mut pairs = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'"' || c == b'\'' {
            let quote = c;
            let open = i;
            let mut j = i + 1;
            let mut closed = None;
            while j < bytes.len() {
                if bytes[j] == b'\\' && j + 1 < bytes.len() {
                    j += 2;
                    continue;
                }
                if bytes[j] == quote {
                    closed = Some(j);
                    break;
                }
                j += 1;
            }
            match closed {
                Some(close) => {
                    pairs.push((open, close));
                    i = close + 1;
                }
                None => i += 1,
            }
        } else {
            i += 1;
        }
    }
    pairs
}

/// Candidate-side post-processing step 1: optional quote-content filter plus
/// cursor-inside-empty-quotes inference.
pub fn apply_candidate_quote_filter(candidates: Vec<Candidate>, input: &str) -> Vec<Candidate> {
    let input_has_quotes = input.contains('"') || input.contains('\'');

    let mut filtered: Vec<Candidate> = if input_has_quotes {
        candidates
    } else {
        let mut seen = std::collections::HashSet::new();
        candidates
            .into_iter()
            .filter_map(|mut c| {
                c.completion = quote_content_filter(&c.completion);
                if seen.insert(c.completion.clone()) {
                    Some(c)
                } else {
                    None
                }
            })
            .collect()
    };

    for candidate in &mut filtered {
        if candidate.cursor_pos.is_some() {
            continue;
        }
        if let Some(&(_, close)) = quote_pairs(&candidate.completion).last() {
            if candidate.completion[close + 1..].is_empty() {
                candidate.cursor_pos = Some(close);
            }
        }
    }

    filtered
}

fn longest_common_prefix_len(strings: &[String]) -> usize {
    if strings.is_empty() {
        return 0;
    }
    let first = strings[0].as_bytes();
    let mut len = first.len();
    for s in &strings[1..] {
        let bytes = s.as_bytes();
        let max = len.min(bytes.len());
        let mut matched = 0;
        while matched < max && first[matched] == bytes[matched] {
            matched += 1;
        }
        len = matched;
        if len == 0 {
            break;
        }
    }
    // Clamp to a char boundary of the first string.
    while len > 0 && !strings[0].is_char_boundary(len) {
        len -= 1;
    }
    len
}

/// Number of characters before the first unescaped quote in `suffix`; `0`
/// when the suffix starts with a quote or contains none at all.
fn quote_extension_length(suffix: &str) -> usize {
    if suffix.starts_with('"') || suffix.starts_with('\'') {
        return 0;
    }
    let bytes = suffix.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            i += 2;
            continue;
        }
        if bytes[i] == b'"' || bytes[i] == b'\'' {
            return suffix[..i].chars().count();
        }
        i += 1;
    }
    0
}

/// Re-ranks candidates when their shared prefix is long enough to suggest
/// they're variations on the same quoted-string completion, per §4.6.
pub fn rerank_by_quote_extension(mut candidates: Vec<Candidate>, input: &str) -> Vec<Candidate> {
    if candidates.len() < 2 {
        return candidates;
    }
    let completions: Vec<String> = candidates.iter().map(|c| c.completion.clone()).collect();
    let lcp_len = longest_common_prefix_len(&completions);
    let threshold = 3.max(input.len() / 2);
    if lcp_len < threshold {
        return candidates;
    }

    let raw_scores: Vec<f64> = completions
        .iter()
        .map(|completion| {
            let suffix = &completion[lcp_len..];
            let len = suffix.chars().count() as f64;
            let qlen = quote_extension_length(suffix) as f64;
            0.2 * len + 0.8 * qlen
        })
        .collect();

    let min = raw_scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = raw_scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let normalized: Vec<f64> = if (max - min).abs() < f64::EPSILON {
        raw_scores.iter().map(|_| 0.0).collect()
    } else {
        raw_scores.iter().map(|s| (s - min) / (max - min)).collect()
    };

    let mut weighted: Vec<(f64, Candidate)> = candidates
        .drain(..)
        .zip(normalized)
        .map(|(c, n)| (0.2 * c.confidence + 0.8 * n, c))
        .collect();
    weighted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    weighted
        .into_iter()
        .enumerate()
        .map(|(idx, (_, mut c))| {
            c.confidence = confidence_at(idx);
            c
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn chain_separator_appends_double_ampersand_by_default() {
        assert_eq!(chain_separator("git status"), " && ");
    }

    #[test]
    fn chain_separator_is_space_after_trailing_operator_without_trailing_space() {
        assert_eq!(chain_separator("git add . &&"), " ");
    }

    #[test]
    fn chain_separator_is_empty_after_trailing_operator_with_trailing_space() {
        assert_eq!(chain_separator("git add . && "), "");
    }

    #[test]
    fn quote_content_filter_empties_matched_pairs() {
        assert_eq!(quote_content_filter(r#"git commit -m "fix bug""#), r#"git commit -m """#);
    }

    #[test]
    fn quote_content_filter_respects_escapes() {
        assert_eq!(quote_content_filter(r#""a\"b""#), r#""""#);
    }

    #[test]
    fn quote_content_filter_preserves_unquoted_text() {
        assert_eq!(quote_content_filter("git status"), "git status");
    }

    #[test]
    fn parse_tagged_replace_concatenates_multiple_commands() {
        let reply = r#"<candidate type="replace"><command>git add .</command><command>git commit</command></candidate>"#;
        let result = parse_tagged_candidates(reply, "git", 4);
        assert_eq!(result, vec![("git add . && git commit".to_string(), None)]);
    }

    #[test]
    fn parse_tagged_append_prepends_input_and_separator() {
        let reply = r#"<candidate type="append"><command>status</command></candidate>"#;
        let result = parse_tagged_candidates(reply, "git", 4);
        assert_eq!(result, vec![("git && status".to_string(), None)]);
    }

    #[test]
    fn parse_tagged_cursor_marker_shifts_for_append() {
        let reply = r#"<candidate type="append"><command>st█atus</command></candidate>"#;
        let result = parse_tagged_candidates(reply, "git", 4);
        assert_eq!(result.len(), 1);
        let (completion, cursor) = &result[0];
        assert_eq!(completion, "git && status");
        assert_eq!(*cursor, Some("git && st".len()));
    }

    #[test]
    fn parse_tagged_cursor_sentinel_lands_inside_empty_quotes() {
        let reply = r#"<candidate type="replace"><command>git commit -m "█"</command></candidate>"#;
        let result = parse_tagged_candidates(reply, "git com", 4);
        assert_eq!(result, vec![(r#"git commit -m """#.to_string(), Some(15))]);
    }

    #[test]
    fn parse_tagged_append_with_auto_separator_scenario() {
        let reply = r#"<candidate type="append"><command>git push</command></candidate>"#;
        let result = parse_tagged_candidates(reply, r#"git commit -m "done""#, 4);
        assert_eq!(result, vec![(r#"git commit -m "done" && git push"#.to_string(), None)]);
    }

    #[test]
    fn parse_tagged_respects_max_candidates() {
        let reply = r#"<candidate type="replace"><command>a</command></candidate><candidate type="replace"><command>b</command></candidate>"#;
        let result = parse_tagged_candidates(reply, "", 1);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn fallback_parse_skips_prompts_and_tags() {
        let reply = "$ git status\n<thinking>\ngit commit\n";
        let result = fallback_parse(reply, "git", 4);
        assert_eq!(result, vec![("git commit".to_string(), None)]);
    }

    #[test]
    fn fallback_parse_requires_matching_first_token() {
        let reply = "ls -la\ngit status\n";
        let result = fallback_parse(reply, "git", 4);
        assert_eq!(result, vec![("git status".to_string(), None)]);
    }

    #[test]
    fn fallback_parse_accepts_anything_when_input_empty() {
        let reply = "ls -la\n";
        let result = fallback_parse(reply, "", 4);
        assert_eq!(result, vec![("ls -la".to_string(), None)]);
    }

    #[test]
    fn confidence_decreases_by_position_with_floor() {
        assert_eq!(confidence_at(0), 0.95);
        assert_eq!(confidence_at(1), 0.80);
        assert!((confidence_at(10) - 0.10).abs() < 1e-9);
    }

    #[test]
    fn candidate_quote_filter_sets_cursor_inside_trailing_empty_quotes() {
        let candidates = vec![Candidate {
            completion: r#"git commit -m "fix bug""#.to_string(),
            confidence: 0.9,
            cursor_pos: None,
        }];
        let result = apply_candidate_quote_filter(candidates, "git commit -m \"f");
        assert_eq!(result[0].completion, r#"git commit -m """#);
        assert_eq!(result[0].cursor_pos, Some(r#"git commit -m ""#.len()));
    }

    #[test]
    fn candidate_quote_filter_leaves_cursor_unset_with_trailing_text() {
        let candidates = vec![Candidate {
            completion: "git commit -m \"fix\" --amend".to_string(),
            confidence: 0.9,
            cursor_pos: None,
        }];
        let result = apply_candidate_quote_filter(candidates, "git commit -m \"f");
        assert_eq!(result[0].cursor_pos, None);
    }

    #[test]
    fn rerank_prioritizes_quote_extending_candidate() {
        let input = r#"git commit -m "feat: implement new funct"#;
        let closes_then_chains = format!("{input}\" && git push");
        let completes_word_then_closes = format!("{}function\"", &input[..input.len() - "funct".len()]);
        let closes_immediately = format!("{input}\"");

        let candidates = vec![
            Candidate { completion: closes_then_chains.clone(), confidence: 0.95, cursor_pos: None },
            Candidate { completion: completes_word_then_closes.clone(), confidence: 0.80, cursor_pos: None },
            Candidate { completion: closes_immediately.clone(), confidence: 0.65, cursor_pos: None },
        ];

        let result = rerank_by_quote_extension(candidates, input);
        assert_eq!(
            result.iter().map(|c| c.completion.clone()).collect::<Vec<_>>(),
            vec![completes_word_then_closes, closes_then_chains, closes_immediately]
        );
        assert_eq!(result[0].confidence, 0.95);
        assert_eq!(result[1].confidence, 0.80);
        assert!((result[2].confidence - 0.65).abs() < 1e-9);
    }

    #[test]
    fn rerank_is_noop_below_prefix_threshold() {
        let candidates = vec![
            Candidate { completion: "git status".to_string(), confidence: 0.9, cursor_pos: None },
            Candidate { completion: "ls -la".to_string(), confidence: 0.5, cursor_pos: None },
        ];
        let result = rerank_by_quote_extension(candidates.clone(), "g");
        assert_eq!(result[0].completion, candidates[0].completion);
    }
}
