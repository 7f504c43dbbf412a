//! Phone number helpers

/// Normalize a dialable number to E.164. North American numbers without a
/// country code get `+1`. Returns `None` for anything that cannot be a
/// phone number.
pub fn normalize_e164(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    let has_plus = trimmed.starts_with('+');

    if trimmed
        .chars()
        .any(|c| !(c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')' | '.')))
    {
        return None;
    }

    match (has_plus, digits.len()) {
        (true, 8..=15) => Some(format!("+{}", digits)),
        (false, 10) => Some(format!("+1{}", digits)),
        (false, 11) if digits.starts_with('1') => Some(format!("+{}", digits)),
        _ => None,
    }
}
