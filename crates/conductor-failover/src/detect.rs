use conductor_protocol::credential::CredentialMaterial;
use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::event::RateLimitKind;
use regex::Regex;

// A notice opens its line (after at most a few glyphs such as `⎿` or `●`).
// Quota notices must also name when the quota resets.
const LIMIT_SIGNATURE_PATTERN: &str = concat!(
    r"(?imR)^[^\p{L}\p{N}\r\n]{0,8}(?:error:\s*)?(?:",
    r"(?:claude(?:\s+ai)?\s+)?usage limit reached(?:[^\r\n]*\bresets?\b|\|\d{9,})",
    r"|(?:you['’]?ve hit your\s+|you have (?:hit|reached) your\s+)?(?:5-hour|weekly|session) limit(?:\s+reached)?[^\r\n]*\bresets?\b",
    r"|rate limit (?:exceeded|reached)\b",
    r")"
);
const WEEKLY_PATTERN: &str = r"(?i)\bweek(?:ly)?\b";
const RESET_HINT_PATTERN: &str = r"(?i)\bresets?\b[^\r\n]*";
const OAUTH_TOKEN_PATTERN: &str = r"(sk-ant-oat01-[A-Za-z0-9_-]{20,})[^A-Za-z0-9_-]";
const ANSI_ESCAPE_PATTERN: &str = r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][0-9A-Za-z]";

const MAX_RESET_HINT_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub kind: RateLimitKind,
    pub matched: String,
    pub reset_hint: Option<String>,
    /// Byte offset just past the line holding the match.
    pub consumed: usize,
}

/// Recognizes rate-limit notices and freshly printed OAuth tokens in agent
/// output.
#[derive(Debug, Clone)]
pub struct RateLimitDetector {
    signature: Regex,
    weekly: Regex,
    reset_hint: Regex,
    oauth_token: Regex,
    ansi_escape: Regex,
}

impl RateLimitDetector {
    pub fn new() -> ConductorResult<Self> {
        Ok(Self {
            signature: compile(LIMIT_SIGNATURE_PATTERN)?,
            weekly: compile(WEEKLY_PATTERN)?,
            reset_hint: compile(RESET_HINT_PATTERN)?,
            oauth_token: compile(OAUTH_TOKEN_PATTERN)?,
            ansi_escape: compile(ANSI_ESCAPE_PATTERN)?,
        })
    }

    /// Output bytes as matchable text with terminal escapes removed.
    pub fn normalize(&self, bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        self.ansi_escape.replace_all(&text, "").into_owned()
    }

    pub fn detect(&self, text: &str) -> Option<Detection> {
        let found = self.signature.find(text)?;
        let line_start = text[..found.start()]
            .rfind(['\n', '\r'])
            .map(|index| index + 1)
            .unwrap_or(0);
        let line_end = text[found.end()..]
            .find(['\n', '\r'])
            .map(|index| found.end() + index)
            .unwrap_or(text.len());
        let line = &text[line_start..line_end];

        let kind = if self.weekly.is_match(line) {
            RateLimitKind::Weekly
        } else {
            RateLimitKind::SessionWindow
        };
        let reset_hint = self
            .reset_hint
            .find(&text[line_start..])
            .map(|hint| truncate_chars(hint.as_str().trim(), MAX_RESET_HINT_CHARS))
            .filter(|hint| !hint.is_empty());

        Some(Detection {
            kind,
            matched: found.as_str().trim().to_owned(),
            reset_hint,
            consumed: line_end,
        })
    }

    /// A complete OAuth token, i.e. one already followed by a delimiter.
    pub fn capture_token(&self, text: &str) -> Option<(CredentialMaterial, usize)> {
        let captures = self.oauth_token.captures_iter(text).last()?;
        let token = captures.get(1)?;
        Some((CredentialMaterial::new(token.as_str()), token.end()))
    }
}

fn compile(pattern: &str) -> ConductorResult<Regex> {
    Regex::new(pattern)
        .map_err(|error| ConductorError::Internal(format!("invalid detector pattern: {error}")))
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use conductor_protocol::event::RateLimitKind;

    use super::RateLimitDetector;

    fn detector() -> RateLimitDetector {
        RateLimitDetector::new().expect("patterns compile")
    }

    #[test]
    fn recognizes_session_window_notices() {
        let detector = detector();

        for notice in [
            "Claude usage limit reached. Your limit will reset at 5pm.",
            "Claude AI usage limit reached|1760000000",
            "Error: Rate limit exceeded",
            "You've hit your 5-hour limit · resets 3am",
            "  ⎿  5-hour limit reached ∙ resets 3am",
            "building\r\nSession limit reached ∙ resets 11pm",
        ] {
            let detection = detector.detect(notice).expect(notice);
            assert_eq!(detection.kind, RateLimitKind::SessionWindow, "{notice}");
        }
    }

    #[test]
    fn weekly_wording_selects_weekly_kind() {
        let detection = detector()
            .detect("You have reached your weekly limit · resets Monday 9am")
            .expect("detection");

        assert_eq!(detection.kind, RateLimitKind::Weekly);
        assert_eq!(detection.reset_hint.as_deref(), Some("resets Monday 9am"));
    }

    #[test]
    fn weekly_on_another_line_does_not_leak_into_the_kind() {
        let detection = detector()
            .detect("weekly summary ready\nusage limit reached, resets 4pm\n")
            .expect("detection");

        assert_eq!(detection.kind, RateLimitKind::SessionWindow);
        assert_eq!(
            detection.consumed,
            "weekly summary ready\nusage limit reached, resets 4pm".len()
        );
    }

    #[test]
    fn ordinary_output_is_ignored() {
        let detector = detector();

        assert!(detector.detect("compiling crate limits v0.1.0").is_none());
        assert!(detector.detect("").is_none());
    }

    #[test]
    fn loose_mentions_of_limits_are_not_notices() {
        let detector = detector();

        for text in [
            "limit reached",
            "LIMIT REACHED",
            "weekly limit reached",
            "see the weekly limit in config.toml",
            "The docs say a usage limit reached error means waiting",
            "// handle rate limit exceeded here",
            "    fn on_limit_reached(&self) {}",
            "retry budget: 5-hour limit, resets are logged",
        ] {
            assert!(detector.detect(text).is_none(), "{text}");
        }
    }

    #[test]
    fn escape_sequences_are_stripped_before_matching() {
        let detector = detector();
        let text = detector.normalize(b"\x1b[31mRate \x1b[1mlimit\x1b[0m reached\x1b]0;title\x07");

        assert_eq!(text, "Rate limit reached");
        assert!(detector.detect(&text).is_some());
    }

    #[test]
    fn token_is_captured_only_once_terminated() {
        let detector = detector();
        let token = "sk-ant-REDACTED";

        assert!(detector.capture_token(&format!("token: {token}")).is_none());
        let (material, end) = detector
            .capture_token(&format!("token: {token}\r\n"))
            .expect("captured");
        assert_eq!(material.expose(), token);
        assert_eq!(end, "token: ".len() + token.len());
    }
}
