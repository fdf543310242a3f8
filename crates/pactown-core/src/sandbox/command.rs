//! Run-command preparation.
//!
//! The run command is taken from the artifact verbatim, with one rewrite:
//! reconciling the port the service was told to bind. Rewrites are defined
//! for exactly the patterns below; anything else is left verbatim (the
//! service still receives `PORT`/`MARKPACT_PORT` in its environment).

use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

static PORT_FLAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--port[=\s]+(\d+)").expect("port flag regex is valid"));

static SHORT_FLAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)-p[=\s]+(\d+)").expect("short flag regex is valid"));

static PORT_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bPORT=(\d+)").expect("port var regex is valid"));

/// Prepare a run command for the allocated port.
///
/// `$PORT`-style variable references are expanded, then literal
/// `--port <N>`, `-p <N>`, and `PORT=<N>` occurrences whose `<N>` differs
/// from the allocated port are replaced with it.
#[must_use]
pub fn prepare_run_command(run: &str, port: u16) -> String {
    let port_str = port.to_string();

    let mut cmd = run.to_string();
    for var in ["${MARKPACT_PORT}", "$MARKPACT_PORT", "${PORT}", "$PORT"] {
        cmd = cmd.replace(var, &port_str);
    }

    let rewritten = PORT_FLAG_RE.replace_all(&cmd, |caps: &Captures<'_>| {
        if &caps[1] == port_str {
            caps[0].to_string()
        } else {
            format!("--port {port_str}")
        }
    });
    let rewritten = SHORT_FLAG_RE.replace_all(&rewritten, |caps: &Captures<'_>| {
        if &caps[2] == port_str {
            caps[0].to_string()
        } else {
            format!("{}-p {port_str}", &caps[1])
        }
    });
    let rewritten = PORT_VAR_RE.replace_all(&rewritten, |caps: &Captures<'_>| {
        if &caps[1] == port_str {
            caps[0].to_string()
        } else {
            format!("PORT={port_str}")
        }
    });

    let prepared = rewritten.into_owned();
    if prepared != run {
        debug!(original = run, prepared = %prepared, "rewrote run command for allocated port");
    }
    prepared
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_flag_rewritten() {
        assert_eq!(
            prepare_run_command("uvicorn main:app --port 8000", 9100),
            "uvicorn main:app --port 9100"
        );
        assert_eq!(
            prepare_run_command("uvicorn main:app --port=8000", 9100),
            "uvicorn main:app --port 9100"
        );
    }

    #[test]
    fn test_matching_port_left_alone() {
        assert_eq!(
            prepare_run_command("uvicorn main:app --port=9100", 9100),
            "uvicorn main:app --port=9100"
        );
    }

    #[test]
    fn test_short_flag_rewritten() {
        assert_eq!(
            prepare_run_command("serve -p 3000 dist/", 9100),
            "serve -p 9100 dist/"
        );
    }

    #[test]
    fn test_port_assignment_rewritten() {
        assert_eq!(
            prepare_run_command("PORT=3000 node server.js", 9100),
            "PORT=9100 node server.js"
        );
    }

    #[test]
    fn test_variable_expansion() {
        assert_eq!(
            prepare_run_command("uvicorn main:app --port $PORT", 9100),
            "uvicorn main:app --port 9100"
        );
        assert_eq!(
            prepare_run_command("node server.js ${MARKPACT_PORT}", 9100),
            "node server.js 9100"
        );
    }

    #[test]
    fn test_bespoke_patterns_left_verbatim() {
        // Not one of the documented patterns; no rewrite is attempted.
        assert_eq!(
            prepare_run_command("gunicorn -b 0.0.0.0:8000 app:app", 9100),
            "gunicorn -b 0.0.0.0:8000 app:app"
        );
    }

    #[test]
    fn test_short_flag_not_matched_inside_words() {
        assert_eq!(
            prepare_run_command("tar --strip-p 2 x", 9100),
            "tar --strip-p 2 x"
        );
    }
}
