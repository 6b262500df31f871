use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use haven_types::models::Participant;

/// `@` followed by word characters, anchored at the end of the input.
static TRAILING_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\w*$").expect("trailing mention pattern is valid"));

/// Byte range and query of a trailing `@token`, if the input ends in one.
pub fn trailing_token(text: &str) -> Option<(usize, &str)> {
    let found = TRAILING_MENTION.find(text)?;
    Some((found.start(), &found.as_str()[1..]))
}

/// Roster members matching the trailing mention token, in roster order.
pub fn candidates<'a>(
    text: &str,
    roster: &'a [Participant],
    self_id: Uuid,
    limit: usize,
) -> Vec<&'a Participant> {
    let Some((_, query)) = trailing_token(text) else {
        return Vec::new();
    };
    let query = query.to_lowercase();

    roster
        .iter()
        .filter(|member| member.id != self_id)
        .filter(|member| member.display_name.to_lowercase().contains(&query))
        .take(limit)
        .collect()
}

/// Replace the trailing token with `@<display name> `.
pub fn apply_selection(text: &str, member: &Participant) -> String {
    let head = match trailing_token(text) {
        Some((start, _)) => &text[..start],
        None => text,
    };
    format!("{}@{} ", head, member.display_name)
}
