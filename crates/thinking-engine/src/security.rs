//! Content sanitization, block-list matching and per-session rate limiting (C2, §4.5).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::EngineError;

/// Strips obviously dangerous markup before block-list matching runs.
///
/// Modeled on `InputValidator`'s approach of neutralizing a handful of
/// specific dangerous constructs rather than attempting a general HTML
/// sanitizer: this is a thinking-content gate, not a browser.
static SCRIPT_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap());
static JAVASCRIPT_URI: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)javascript:").unwrap());
static EVAL_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)eval\s*\(").unwrap());
static FUNCTION_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Function\s*\(").unwrap());
static ON_EVENT_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\bon\w+\s*="#).unwrap());

/// Strip `<script>` blocks, `javascript:` URIs, `eval(`/`Function(` calls and
/// `on<word>=` event-handler attributes out of `input`.
pub fn sanitize(input: &str) -> String {
    let step1 = SCRIPT_TAG.replace_all(input, "");
    let step2 = JAVASCRIPT_URI.replace_all(&step1, "");
    let step3 = EVAL_CALL.replace_all(&step2, "");
    let step4 = FUNCTION_CALL.replace_all(&step3, "");
    let step5 = ON_EVENT_ATTR.replace_all(&step4, "");
    step5.into_owned()
}

/// Compiled block-list, rebuilt whenever `EngineConfig::blocked_patterns` changes.
pub struct BlockList {
    patterns: Vec<Regex>,
}

impl BlockList {
    pub fn compile(patterns: &[String]) -> Result<Self, String> {
        let compiled = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| format!("invalid blocked pattern {p:?}: {e}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns: compiled })
    }

    /// Returns the first pattern that matched `text`, if any.
    pub fn first_match(&self, text: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|re| re.is_match(text))
            .map(|re| re.as_str())
    }
}

/// Sanitize then block-list check. Returns `Ok(sanitized)` or a
/// `SECURITY_ERROR` naming the pattern that tripped.
pub fn sanitize_and_check(input: &str, block_list: &BlockList) -> Result<String, EngineError> {
    let sanitized = sanitize(input);
    if let Some(pattern) = block_list.first_match(&sanitized) {
        return Err(EngineError::security(format!(
            "content matched blocked pattern: {pattern}"
        )));
    }
    Ok(sanitized)
}

/// Per-session sliding one-minute window rate limiter.
///
/// A single `Vec<Instant>` of recent hits per session, pruned lazily on each
/// check — simple and exactly matches the spec's "check-then-record in one
/// atomic step" requirement when called under the session's own lock, rather
/// than a separate global limiter that would need its own synchronization.
pub struct RateLimiter {
    window: Duration,
    limit: u32,
    hits: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            window: Duration::from_secs(60),
            limit,
            hits: HashMap::new(),
        }
    }

    /// If `session_id` is under its limit, records one hit and returns `Ok(())`.
    /// Otherwise leaves state untouched and returns `Err`.
    pub fn check_and_record(&mut self, session_id: &str) -> Result<(), EngineError> {
        let now = Instant::now();
        let window = self.window;
        let entry = self.hits.entry(session_id.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < window);

        if entry.len() as u32 >= self.limit {
            return Err(EngineError::security(format!(
                "rate limit exceeded: {} requests per minute",
                self.limit
            )));
        }

        entry.push(now);
        Ok(())
    }

    pub fn forget_session(&mut self, session_id: &str) {
        self.hits.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_script_tags() {
        let out = sanitize("before<script>alert(1)</script>after");
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn sanitize_strips_javascript_uri_and_event_handlers() {
        let out = sanitize(r#"<a href="javascript:alert(1)" onclick="evil()">x</a>"#);
        assert!(!out.to_lowercase().contains("javascript:"));
        assert!(!out.to_lowercase().contains("onclick="));
    }

    #[test]
    fn sanitize_strips_eval_and_function_calls() {
        let out = sanitize("eval(malicious()); new Function('return 1')()");
        assert!(!out.contains("eval("));
        assert!(!out.contains("Function("));
    }

    #[test]
    fn block_list_flags_sql_injection_pattern() {
        let block_list = BlockList::compile(&[r"(?i)\bunion\s+select\b".to_string()]).unwrap();
        let result = sanitize_and_check("1 UNION SELECT password FROM users", &block_list);
        assert!(result.is_err());
    }

    #[test]
    fn block_list_allows_clean_text() {
        let block_list = BlockList::compile(&[r"(?i)\bunion\s+select\b".to_string()]).unwrap();
        let result = sanitize_and_check("a perfectly normal thought", &block_list);
        assert_eq!(result.unwrap(), "a perfectly normal thought");
    }

    #[test]
    fn rate_limiter_allows_up_to_limit_then_rejects() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.check_and_record("s1").is_ok());
        assert!(limiter.check_and_record("s1").is_ok());
        assert!(limiter.check_and_record("s1").is_err());
    }

    #[test]
    fn rate_limiter_tracks_sessions_independently() {
        let mut limiter = RateLimiter::new(1);
        assert!(limiter.check_and_record("s1").is_ok());
        assert!(limiter.check_and_record("s2").is_ok());
        assert!(limiter.check_and_record("s1").is_err());
    }
}
