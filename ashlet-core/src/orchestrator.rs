//! Ties the collaborators together into one completion request (§4.6):
//! entry conditions, context gathering, prompt rendering, the model call,
//! reply parsing, and post-processing.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::engine::EngineInner;
use crate::error::ClientErrorCode;
use crate::protocol::Candidate;
use crate::protocol::Request;
use crate::protocol::Response;
use crate::redactor;

const RECENT_HISTORY_COUNT: usize = 20;
const RELEVANT_HISTORY_COUNT: usize = 20;
const RECENT_IN_PROMPT: usize = 5;
const INIT_DONE_WAIT: Duration = Duration::from_secs(10);

const DEFAULT_SYSTEM_PROMPT: &str = include_str!("prompts/default_system_prompt.md.j2");

/// Runs one completion request to a reply, or `None` if cancelled before a
/// reply could be produced.
pub async fn complete(inner: &EngineInner, request: &Request, cancel: &CancellationToken) -> Option<Response> {
    let input = trim_trailing_newline(&request.input);
    let cwd = trim_trailing_newline(&request.cwd);
    let cursor_pos = snap_to_char_boundary(&input, (request.cursor_pos.max(0) as usize).min(input.len()));

    if input.trim().is_empty() {
        return Some(Response::empty(request.request_id));
    }
    if inner.config.generation.api_key.is_empty() {
        return Some(Response::error(
            request.request_id,
            ClientErrorCode::NotConfigured,
            "no generation API key configured",
        ));
    }

    let dircontext = inner.dircontext.get(&cwd).await;

    let (recent, relevant) = match gather_history(inner, &input, cancel).await {
        Some(pair) => pair,
        None => return None,
    };

    let max_candidates = request.effective_max_candidates();
    let system_prompt = render_system_prompt(inner, max_candidates);
    let user_message = build_user_message(&cwd, dircontext.as_ref(), &recent, &relevant, &input, cursor_pos);

    let reply_text = tokio::select! {
        _ = cancel.cancelled() => return None,
        result = inner.generator.generate(&system_prompt, &user_message) => {
            match result {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "generation call failed");
                    return Some(Response::error(request.request_id, ClientErrorCode::ApiError, err.to_string()));
                }
            }
        }
    };

    if cancel.is_cancelled() {
        return None;
    }

    let mut parsed = crate::parsing::parse_tagged_candidates(&reply_text, &input, max_candidates);
    if parsed.is_empty() {
        parsed = crate::parsing::fallback_parse(&reply_text, &input, max_candidates);
    }

    let candidates: Vec<Candidate> = parsed
        .into_iter()
        .enumerate()
        .map(|(idx, (completion, cursor_pos))| Candidate {
            completion,
            confidence: crate::parsing::confidence_at(idx),
            cursor_pos,
        })
        .collect();

    let candidates = crate::parsing::apply_candidate_quote_filter(candidates, &input);
    let candidates = crate::parsing::rerank_by_quote_extension(candidates, &input);

    Some(Response {
        request_id: request.request_id,
        candidates,
        error: None,
    })
}

fn trim_trailing_newline(s: &str) -> String {
    s.trim_end_matches(['\n', '\r']).to_string()
}

fn snap_to_char_boundary(s: &str, mut pos: usize) -> usize {
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Implements the §4.6 policy table for `recent`/`related` history context.
async fn gather_history(inner: &EngineInner, input: &str, cancel: &CancellationToken) -> Option<(Vec<String>, Vec<String>)> {
    if !inner.history.has_embedder() {
        return Some((inner.history.recent_commands(RECENT_HISTORY_COUNT).await, Vec::new()));
    }

    if !inner.config.history.no_raw_history {
        let recent = inner.history.recent_commands(RECENT_HISTORY_COUNT).await;
        let init_rx = inner.history.init_done_signal();
        let relevant = if *init_rx.borrow() {
            inner.history.search_relevant(input, RELEVANT_HISTORY_COUNT).await
        } else {
            Vec::new()
        };
        return Some((recent, relevant));
    }

    let mut init_rx = inner.history.init_done_signal();
    if !*init_rx.borrow() {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::timeout(INIT_DONE_WAIT, init_rx.changed()) => {},
        }
    }
    let relevant = inner.history.search_relevant(input, RELEVANT_HISTORY_COUNT).await;
    Some((Vec::new(), relevant))
}

/// Exposes the embedded default template source for the `default_prompt`
/// config action.
pub fn default_system_prompt_source() -> &'static str {
    DEFAULT_SYSTEM_PROMPT
}

fn render_system_prompt(inner: &EngineInner, max_candidates: usize) -> String {
    if let Some(template_src) = &inner.system_prompt_override {
        match render_template(template_src, max_candidates) {
            Ok(rendered) => return rendered,
            Err(err) => warn!(error = %err, "user system prompt template failed, falling back to default"),
        }
    }
    render_template(DEFAULT_SYSTEM_PROMPT, max_candidates).unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string())
}

fn render_template(source: &str, max_candidates: usize) -> std::result::Result<String, minijinja::Error> {
    let mut env = minijinja::Environment::new();
    env.add_template("system", source)?;
    let tmpl = env.get_template("system")?;
    tmpl.render(minijinja::context! { max_candidates => max_candidates })
}

/// Newline-separated key/value lines in the fixed order described in §4.6:
/// `cwd`, then (when a `DirContext` is available) `files`, `pkg`,
/// `git root`, `staged`, then each manifest under its own label
/// ("project files" collectively), then `recent`/`related` history, then
/// the `Input:` line.
fn build_user_message(
    cwd: &str,
    dircontext: Option<&crate::dircontext::DirContext>,
    recent: &[String],
    relevant: &[String],
    input: &str,
    cursor_pos: usize,
) -> String {
    let mut lines = Vec::new();
    lines.push(format!("cwd: {cwd}"));

    if let Some(ctx) = dircontext {
        if !ctx.cwd_listing.is_empty() {
            lines.push(format!("files: {}", ctx.cwd_listing));
        }
        if !ctx.package_manager.is_empty() {
            lines.push(format!("pkg: {}", ctx.package_manager));
        }
        if !ctx.git_root_listing.is_empty() {
            lines.push(format!("git root: {}", ctx.git_root_listing));
        }
        if !ctx.git_staged_files.is_empty() {
            lines.push(format!("staged: {}", ctx.git_staged_files));
        }
        let mut manifests: Vec<(&String, &String)> = ctx.cwd_manifests.iter().chain(ctx.git_manifests.iter()).collect();
        manifests.sort_by(|a, b| a.0.cmp(b.0));
        for (label, summary) in manifests {
            lines.push(format!("{label}: {summary}"));
        }
    }

    let recent_line = history_prompt_line(recent, RECENT_IN_PROMPT);
    if let Some(line) = recent_line {
        lines.push(format!("recent: {line}"));
    }
    let related_line = history_prompt_line(relevant, relevant.len());
    if let Some(line) = related_line {
        lines.push(format!("related: {line}"));
    }

    lines.push(build_input_line(input, cursor_pos));
    lines.join("\n")
}

fn history_prompt_line(commands: &[String], cap: usize) -> Option<String> {
    let start = commands.len().saturating_sub(cap);
    let redacted: Vec<String> = commands[start..].iter().map(|c| redactor::redact(c)).collect();
    let filtered = crate::parsing::filter_and_dedup_history(&redacted);
    if filtered.is_empty() {
        None
    } else {
        Some(filtered.join("; "))
    }
}

/// The `Input:` line is never redacted and carries the cursor sentinel only
/// when the cursor isn't already at the end of the buffer.
fn build_input_line(input: &str, cursor_pos: usize) -> String {
    if cursor_pos >= input.len() {
        format!("Input: `{input}`")
    } else {
        let mut marked = String::with_capacity(input.len() + 4);
        marked.push_str(&input[..cursor_pos]);
        marked.push('█');
        marked.push_str(&input[cursor_pos..]);
        format!("Input: `{marked}`")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn build_input_line_omits_marker_at_end_of_buffer() {
        assert_eq!(build_input_line("git com", 7), "Input: `git com`");
    }

    #[test]
    fn build_input_line_marks_cursor_mid_buffer() {
        assert_eq!(build_input_line("git com", 3), "Input: `git\u{2588} com`");
    }

    #[test]
    fn build_user_message_orders_lines_and_skips_empty_dircontext() {
        let message = build_user_message("/home/user/project", None, &[], &[], "git com", 7);
        assert_eq!(message, "cwd: /home/user/project\nInput: `git com`");
    }

    #[test]
    fn build_user_message_includes_dircontext_fields_in_order() {
        let mut ctx = crate::dircontext::DirContext::default();
        ctx.cwd_listing = "Cargo.toml src".to_string();
        ctx.package_manager = "cargo".to_string();
        ctx.git_staged_files = "M:src/main.rs".to_string();

        let message = build_user_message("/repo", Some(&ctx), &[], &[], "git", 3);
        let lines: Vec<&str> = message.lines().collect();
        assert_eq!(lines[0], "cwd: /repo");
        assert_eq!(lines[1], "files: Cargo.toml src");
        assert_eq!(lines[2], "pkg: cargo");
        assert_eq!(lines[3], "staged: M:src/main.rs");
    }

    #[test]
    fn history_prompt_line_redacts_and_dedupes() {
        let commands = vec!["export API_KEY=hunter2".to_string(), "export API_KEY=hunter2".to_string()];
        let line = history_prompt_line(&commands, 5).expect("some");
        assert_eq!(line, "export API_KEY=***");
    }

    #[test]
    fn history_prompt_line_is_none_when_empty() {
        assert!(history_prompt_line(&[], 5).is_none());
    }

    #[test]
    fn default_system_prompt_renders_with_max_candidates() {
        let rendered = render_template(DEFAULT_SYSTEM_PROMPT, 4).expect("renders");
        assert!(rendered.contains('4'));
    }

    #[test]
    fn malformed_user_template_fails_to_render() {
        let result = render_template("{{ unterminated", 4);
        assert!(result.is_err());
    }
}
