//! Small string helpers

use std::borrow::Cow;

/// Longest prefix of `s` that fits in `max_bytes` without splitting a character.
///
/// ```
/// use widget_sync::util::truncate_utf8_safe;
///
/// assert_eq!(truncate_utf8_safe("update", 3), "upd");
/// // "é" is two bytes and is never cut in half
/// assert_eq!(truncate_utf8_safe("café", 4), "caf");
/// ```
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let end = s
        .char_indices()
        .map(|(start, _)| start)
        .take_while(|start| *start <= max_bytes)
        .last()
        .unwrap_or(0);
    &s[..end]
}

/// `s` cut to `max_bytes` with "..." appended when anything was dropped
pub fn ellipsize(s: &str, max_bytes: usize) -> Cow<'_, str> {
    let cut = truncate_utf8_safe(s, max_bytes);
    if cut.len() == s.len() {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("{}...", cut))
    }
}
