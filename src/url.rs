//! Source sanitizing and validation.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;

use crate::error::{Error, Result};

static ESCAPED_AMP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&?(?:amp;)+").expect("valid regex"));

/// Cleans a raw source string copied out of HTML or a wrapped text block.
///
/// Removes every whitespace character (including the newlines that wrapped
/// links tend to pick up) and collapses HTML-escaped ampersands. A stray
/// `amp;` with its `&` already stripped is treated the same way.
///
/// ```
/// use video_dl::url::sanitize_source;
///
/// assert_eq!(
///     sanitize_source("https://host/v.mp4?loc=extern\nal&amp;sig=1"),
///     "https://host/v.mp4?loc=external&sig=1",
/// );
/// ```
#[must_use]
pub fn sanitize_source(raw: &str) -> String {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    ESCAPED_AMP_RE.replace_all(&compact, "&").into_owned()
}

/// Parses a sanitized source into a transfer location.
///
/// # Errors
///
/// Returns [`Error::Validation`] unless `source` is an absolute `http` or
/// `https` URL with a host.
pub fn parse_source(source: &str) -> Result<Url> {
    let invalid = |reason: &str| Error::Validation {
        input: source.to_string(),
        reason: reason.to_string(),
    };

    if source.is_empty() {
        return Err(invalid("empty source"));
    }
    let url = Url::parse(source).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("unsupported scheme"));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- sanitize_source ---

    #[test]
    fn sanitize_removes_wrapped_newlines() {
        assert_eq!(
            sanitize_source("https://host/file.mp4?loc=extern\nal"),
            "https://host/file.mp4?loc=external"
        );
    }

    #[test]
    fn sanitize_decodes_escaped_ampersand() {
        assert_eq!(
            sanitize_source("https://host/f.mp4?a=1&amp;b=2"),
            "https://host/f.mp4?a=1&b=2"
        );
    }

    #[test]
    fn sanitize_handles_newline_before_escape() {
        assert_eq!(
            sanitize_source("https://host/f.mp4?loc=external\n&amp;signature=abc"),
            "https://host/f.mp4?loc=external&signature=abc"
        );
    }

    #[test]
    fn sanitize_handles_stray_amp_fragment() {
        assert_eq!(
            sanitize_source("https://host/f.mp4?a=1amp;b=2"),
            "https://host/f.mp4?a=1&b=2"
        );
    }

    #[test]
    fn sanitize_handles_double_escaping() {
        assert_eq!(
            sanitize_source("https://host/f.mp4?a=1&amp;amp;b=2"),
            "https://host/f.mp4?a=1&b=2"
        );
    }

    #[test]
    fn sanitize_removes_spaces_and_tabs() {
        assert_eq!(sanitize_source("  https://host/ a.mp4\t"), "https://host/a.mp4");
    }

    #[test]
    fn sanitize_leaves_clean_url_untouched() {
        let url = "https://host/a.mp4?x=1&y=2";
        assert_eq!(sanitize_source(url), url);
    }

    // --- parse_source ---

    #[test]
    fn parse_accepts_http_and_https() {
        assert!(parse_source("https://host/a.mp4").is_ok());
        assert!(parse_source("http://127.0.0.1:8080/b.mp4").is_ok());
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(matches!(parse_source(""), Err(Error::Validation { .. })));
    }

    #[test]
    fn parse_rejects_relative() {
        assert!(matches!(
            parse_source("videos/a.mp4"),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn parse_rejects_other_schemes() {
        assert!(matches!(
            parse_source("ftp://host/a.mp4"),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            parse_source("file:///tmp/a.mp4"),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn parse_rejects_whitespace_in_host() {
        assert!(parse_source("https://ho st/a.mp4").is_err());
    }

    #[test]
    fn validation_error_keeps_input() {
        let Err(Error::Validation { input, .. }) = parse_source("not a url") else {
            panic!("expected validation error");
        };
        assert_eq!(input, "not a url");
    }
}
