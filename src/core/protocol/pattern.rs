//! Subscription pattern matching.
//!
//! A pattern without `*` matches only the identical id. `*` is the only
//! wildcard and spans any run of characters, including dots. Matching
//! happens in-process on every inbound event, so patterns are compiled once
//! and cached by the registry.

use regex::Regex;

#[derive(Debug, Clone)]
pub struct SubscriptionPattern {
    raw: String,
    regex: Option<Regex>,
}

impl SubscriptionPattern {
    /// Compile a pattern. All regex metacharacters in the input are treated
    /// literally except `*`.
    pub fn compile(pattern: &str) -> Self {
        let regex = if pattern.contains('*') {
            let escaped = regex::escape(pattern).replace("\\*", ".*");
            Regex::new(&format!("^{escaped}$")).ok()
        } else {
            None
        };
        Self { raw: pattern.to_string(), regex }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.regex.is_some()
    }

    pub fn matches(&self, id: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(id),
            None => self.raw == id,
        }
    }
}
