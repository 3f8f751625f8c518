//! Command framing over the serial console.
//!
//! The guest is a blind shell on a single interleaved stream. Each exec
//! sends one compound command that redirects stdout/stderr into temp files
//! and replays them between literal markers, followed by the exit code and
//! a `poweroff`. Recovery always uses the LAST marker occurrence so user
//! output that embeds the marker strings cannot confuse parsing.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::bytes::Regex as BytesRegex;
use regex::Regex;

use super::shell::{shell_exports, shell_quote};

pub(crate) const EXIT_CODE_MARKER: &str = "__VIBEBOX_EXIT_CODE__";
pub(crate) const STDOUT_BEGIN_MARKER: &str = "__VIBEBOX_STDOUT_BEGIN__";
pub(crate) const STDOUT_END_MARKER: &str = "__VIBEBOX_STDOUT_END__";
pub(crate) const STDERR_BEGIN_MARKER: &str = "__VIBEBOX_STDERR_BEGIN__";
pub(crate) const STDERR_END_MARKER: &str = "__VIBEBOX_STDERR_END__";

/// The one-shot exec command sent to the guest shell.
pub(crate) fn build_exec_script(
    guest_cwd: &str,
    command: &str,
    env: &HashMap<String, String>,
) -> String {
    format!(
        "tmp_out=$(mktemp); tmp_err=$(mktemp); \
         (cd {cwd} && {exports}bash -lc {cmd}) >\"$tmp_out\" 2>\"$tmp_err\"; rc=$?; \
         printf '{out_begin}\\n'; cat \"$tmp_out\"; printf '\\n{out_end}\\n'; \
         printf '{err_begin}\\n'; cat \"$tmp_err\"; printf '\\n{err_end}\\n'; \
         printf '{exit}%s\\n' \"$rc\"; \
         rm -f \"$tmp_out\" \"$tmp_err\"; poweroff",
        cwd = shell_quote(guest_cwd),
        exports = shell_exports(env),
        cmd = shell_quote(command),
        out_begin = STDOUT_BEGIN_MARKER,
        out_end = STDOUT_END_MARKER,
        err_begin = STDERR_BEGIN_MARKER,
        err_end = STDERR_END_MARKER,
        exit = EXIT_CODE_MARKER,
    )
}

fn exit_marker_regex() -> &'static BytesRegex {
    static RE: OnceLock<BytesRegex> = OnceLock::new();
    RE.get_or_init(|| {
        BytesRegex::new(&format!("{}(\\d+)", regex::escape(EXIT_CODE_MARKER)))
            .expect("static regex")
    })
}

/// Exit code from the LAST marker occurrence, if any.
pub(crate) fn parse_exit_marker(output: &[u8]) -> Option<i32> {
    let captures = exit_marker_regex().captures_iter(output).last()?;
    let digits = std::str::from_utf8(captures.get(1)?.as_bytes()).ok()?;
    digits.parse().ok()
}

/// Remove every line carrying an exit marker (used by the fallback path,
/// where the whole buffer doubles as stdout).
pub(crate) fn strip_exit_marker_lines(output: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(&format!(r"(?m)^.*{}\d+.*\n?", regex::escape(EXIT_CODE_MARKER)))
            .expect("static regex")
    });
    re.replace_all(output, "").into_owned()
}

/// Structured recovery: stdout/stderr between the last begin/end marker
/// pairs plus the exit code. A single leading newline on each stream is an
/// artifact of the framing printf and is trimmed.
pub(crate) fn parse_structured_output(output: &[u8]) -> Option<(String, String, i32)> {
    let exit_code = parse_exit_marker(output)?;
    let stdout = extract_between(output, STDOUT_BEGIN_MARKER, STDOUT_END_MARKER)?;
    let stderr = extract_between(output, STDERR_BEGIN_MARKER, STDERR_END_MARKER)?;
    Some((
        trim_one_leading_newline(stdout),
        trim_one_leading_newline(stderr),
        exit_code,
    ))
}

fn trim_one_leading_newline(segment: &[u8]) -> String {
    let segment = segment.strip_prefix(b"\n").unwrap_or(segment);
    String::from_utf8_lossy(segment).into_owned()
}

fn extract_between<'a>(output: &'a [u8], begin: &str, end: &str) -> Option<&'a [u8]> {
    let start = rfind_sub(output, begin.as_bytes())? + begin.len();
    let remaining = &output[start..];
    let finish = find_sub(remaining, end.as_bytes())?;
    Some(&remaining[..finish])
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Drop ANSI escape sequences.
pub(crate) fn strip_ansi(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new("\x1b\\[[0-9;]*[a-zA-Z]").expect("static regex"));
    re.replace_all(s, "").into_owned()
}

/// Trimmed, de-escaped tail of the console output, for diagnostics.
pub(crate) fn output_tail(s: &str, max: usize) -> String {
    let clean = strip_ansi(s);
    let clean = clean.trim();
    if clean.len() <= max {
        return clean.to_string();
    }
    let mut idx = clean.len() - max;
    while !clean.is_char_boundary(idx) {
        idx += 1;
    }
    clean[idx..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(stdout: &str, stderr: &str, code: i32) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}{}\n",
            STDOUT_BEGIN_MARKER,
            stdout,
            STDOUT_END_MARKER,
            STDERR_BEGIN_MARKER,
            stderr,
            STDERR_END_MARKER,
            EXIT_CODE_MARKER,
            code
        )
        .into_bytes()
    }

    #[test]
    fn test_structured_parse() {
        // The framing prints '\n' before each END marker so streams that do
        // not end in a newline still frame cleanly; content keeps it.
        let output = framed("hello", "warn", 0);
        let (stdout, stderr, code) = parse_structured_output(&output).unwrap();
        assert_eq!(stdout, "hello\n");
        assert_eq!(stderr, "warn\n");
        assert_eq!(code, 0);
    }

    #[test]
    fn test_exit_255_is_preserved() {
        let output = framed("", "", 255);
        let (_, _, code) = parse_structured_output(&output).unwrap();
        assert_eq!(code, 255);
    }

    #[test]
    fn test_last_exit_marker_wins() {
        // A command that prints a fake marker itself: the framing appends
        // the real one afterwards, so the LAST occurrence is authoritative.
        let mut output = format!("{}7\n", EXIT_CODE_MARKER).into_bytes();
        output.extend_from_slice(&framed(&format!("{}7", EXIT_CODE_MARKER), "", 0));
        let (stdout, _, code) = parse_structured_output(&output).unwrap();
        assert_eq!(code, 0);
        assert!(stdout.contains(EXIT_CODE_MARKER));
    }

    #[test]
    fn test_embedded_stream_markers_are_recovered() {
        // User stdout containing the literal begin/end markers still parses
        // because extraction anchors on the LAST begin marker.
        let inner = format!("{}\ninjected\n{}", STDOUT_BEGIN_MARKER, EXIT_CODE_MARKER);
        let mut output = framed("early", "e", 9);
        output.extend_from_slice(&framed(&inner, "", 4));
        let (stdout, _, code) = parse_structured_output(&output).unwrap();
        assert_eq!(code, 4);
        // Extraction anchored on the embedded (last) begin marker.
        assert_eq!(stdout, "injected\n__VIBEBOX_EXIT_CODE__\n");
    }

    #[test]
    fn test_nul_bytes_round_trip() {
        let output = framed("a\0b", "", 0);
        let (stdout, _, _) = parse_structured_output(&output).unwrap();
        assert_eq!(stdout, "a\0b\n");
    }

    #[test]
    fn test_fallback_exit_marker_only() {
        let output = format!("boot noise\n{}42\nmore\n", EXIT_CODE_MARKER);
        assert_eq!(parse_exit_marker(output.as_bytes()), Some(42));
        assert!(parse_structured_output(output.as_bytes()).is_none());

        let stripped = strip_exit_marker_lines(&output);
        assert_eq!(stripped, "boot noise\nmore\n");
    }

    #[test]
    fn test_no_marker_at_all() {
        assert_eq!(parse_exit_marker(b"kernel panic"), None);
        assert!(parse_structured_output(b"kernel panic").is_none());
    }

    #[test]
    fn test_build_exec_script_shape() {
        let mut env = HashMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "it's".to_string());
        let script = build_exec_script("/workspace", "echo hi", &env);

        assert!(script.starts_with("tmp_out=$(mktemp); tmp_err=$(mktemp);"));
        assert!(script.contains("cd '/workspace'"));
        // Exports are key-sorted for reproducibility.
        let a = script.find("export A=").unwrap();
        let b = script.find("export B=").unwrap();
        assert!(a < b);
        assert!(script.contains(r"export A='it'\''s';"));
        assert!(script.contains("bash -lc 'echo hi'"));
        assert!(script.ends_with("poweroff"));
        assert!(script.contains(&format!("printf '{}%s\\n' \"$rc\"", EXIT_CODE_MARKER)));
    }

    #[test]
    fn test_strip_ansi_and_tail() {
        let colored = "\x1b[31mred\x1b[0m plain";
        assert_eq!(strip_ansi(colored), "red plain");

        let long = "x".repeat(600);
        assert_eq!(output_tail(&long, 512).len(), 512);
        assert_eq!(output_tail("short", 512), "short");
    }
}
