use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

/// Build a [`Notify`] that fires once when SIGINT or SIGTERM is delivered.
/// Used by `ashletd`'s accept loop to stop accepting new connections while
/// letting in-flight ones finish.
pub fn notify_on_shutdown_signal() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());

    tokio::spawn({
        let notify = Arc::clone(&notify);
        async move {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    debug!(error = %err, "failed to install SIGTERM handler, waiting on SIGINT only");
                    tokio::signal::ctrl_c().await.ok();
                    notify.notify_waiters();
                    return;
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => debug!("received SIGINT"),
                _ = sigterm.recv() => debug!("received SIGTERM"),
            }
            notify.notify_waiters();
        }
    });

    notify
}

/// Collapse runs of ASCII spaces into one and trim the ends. Several
/// pipeline stages (candidate post-processing, manifest summaries) need this
/// exact normalization.
pub fn collapse_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for c in s.trim().chars() {
        if c == ' ' {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

/// Truncate `s` to at most `cap` bytes on a char boundary, appending an
/// ellipsis marker when truncation actually occurred.
pub fn truncate_with_ellipsis(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut end = cap.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn collapse_spaces_merges_runs_and_trims() {
        assert_eq!(collapse_spaces("  git   commit  "), "git commit");
    }

    #[test]
    fn truncate_with_ellipsis_noop_under_cap() {
        assert_eq!(truncate_with_ellipsis("short", 512), "short");
    }

    #[test]
    fn truncate_with_ellipsis_cuts_and_marks() {
        let long = "a".repeat(600);
        let truncated = truncate_with_ellipsis(&long, 512);
        assert_eq!(truncated.chars().count(), 513);
        assert!(truncated.ends_with('…'));
    }
}
