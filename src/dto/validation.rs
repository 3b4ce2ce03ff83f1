//! Validation helpers for wire payloads.

use validator::ValidationError;

/// Validates a room identifier: 4 to 32 characters, ASCII alphanumerics,
/// dashes, and underscores only.
///
/// # Examples
///
/// ```ignore
/// validate_room_id("lobby-42")   // Ok
/// validate_room_id("ab")         // Err - too short
/// validate_room_id("room!")      // Err - invalid character
/// ```
pub fn validate_room_id(id: &str) -> Result<(), ValidationError> {
    if id.len() < 4 || id.len() > 32 {
        let mut err = ValidationError::new("room_id_length");
        err.message =
            Some(format!("Room ID must be 4-32 characters (got {})", id.len()).into());
        return Err(err);
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        let mut err = ValidationError::new("room_id_format");
        err.message =
            Some("Room ID may contain only letters, digits, dashes, and underscores".into());
        return Err(err);
    }

    Ok(())
}

/// Trim a chat message and cap it at `max_len` characters.
/// Returns `None` when nothing remains after trimming.
pub fn normalize_chat_text(text: &str, max_len: usize) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(max_len).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_room_id_valid() {
        assert!(validate_room_id("lobby-42").is_ok());
        assert!(validate_room_id("room_ABC_99").is_ok());
        assert!(validate_room_id("abcd").is_ok());
    }

    #[test]
    fn test_validate_room_id_invalid_length() {
        assert!(validate_room_id("abc").is_err()); // too short
        assert!(validate_room_id(&"a".repeat(33)).is_err()); // too long
        assert!(validate_room_id("").is_err()); // empty
    }

    #[test]
    fn test_validate_room_id_invalid_format() {
        assert!(validate_room_id("room 42").is_err()); // space
        assert!(validate_room_id("room!42").is_err()); // punctuation
        assert!(validate_room_id("sälön").is_err()); // non-ascii
    }

    #[test]
    fn chat_text_is_trimmed_and_capped() {
        assert_eq!(normalize_chat_text("  hi  ", 500).as_deref(), Some("hi"));
        assert_eq!(normalize_chat_text("   ", 500), None);
        assert_eq!(normalize_chat_text("abcdef", 3).as_deref(), Some("abc"));
    }
}
