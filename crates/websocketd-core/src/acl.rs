//! ACL pattern compilation and matching.
//!
//! Patterns are `.`-separated scopes where `*` matches a single segment and
//! `#` spans segments. The reserved words `me` and `my_session` are
//! substituted with the token's user and session UUIDs before compilation.
//! A leading `!` marks a deny pattern; denies win over allows.

use regex::Regex;

/// Compiled access checker for one token. Build once, match many.
pub struct AccessCheck {
    positive: Vec<Regex>,
    negative: Vec<Regex>,
}

impl AccessCheck {
    pub fn new(user_uuid: &str, session_uuid: &str, acl: &[String]) -> Self {
        let compile = |pattern: &str| compile_pattern(user_uuid, session_uuid, pattern);

        Self {
            positive: acl
                .iter()
                .filter(|access| !access.starts_with('!'))
                .filter_map(|access| compile(access))
                .collect(),
            negative: acl
                .iter()
                .filter(|access| access.starts_with('!'))
                .filter_map(|access| compile(&access[1..]))
                .collect(),
        }
    }

    /// `None` means the event declares no ACL requirement and is accepted.
    pub fn matches_required_acl(&self, required_acl: Option<&str>) -> bool {
        let required = match required_acl {
            None => return true,
            Some(required) => required,
        };

        if self.negative.iter().any(|re| re.is_match(required)) {
            return false;
        }
        self.positive.iter().any(|re| re.is_match(required))
    }
}

/// Anchored regex for one pattern: `*` -> `[^.]*?`, `#` -> `.*?`.
fn compile_pattern(user_uuid: &str, session_uuid: &str, pattern: &str) -> Option<Regex> {
    let pattern = substitute_reserved(pattern, "me", user_uuid);
    let pattern = substitute_reserved(&pattern, "my_session", session_uuid);

    let escaped = regex::escape(&pattern)
        .replace("\\*", "[^.]*?")
        .replace("\\#", ".*?");
    Regex::new(&format!("^{escaped}$")).ok()
}

/// Replace `.{word}` as the final segment, or `.{word}.` in the middle,
/// with the given UUID.
fn substitute_reserved(pattern: &str, word: &str, uuid: &str) -> String {
    let suffix = format!(".{word}");
    if let Some(prefix) = pattern.strip_suffix(&suffix) {
        return format!("{prefix}.{uuid}");
    }
    pattern.replace(&format!(".{word}."), &format!(".{uuid}."))
}
