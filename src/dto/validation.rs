//! Validation helpers for DTOs.

use validator::ValidationError;

/// Alphabet room codes are drawn from: uppercase, with the glyphs that read
/// ambiguously on a phone screen (I, O, 0, 1) left out.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a room code.
pub const ROOM_CODE_LENGTH: usize = 4;

/// Validates that a room code is exactly four characters from the code
/// alphabet.
///
/// # Examples
///
/// ```ignore
/// validate_room_code("BQ7X") // Ok
/// validate_room_code("bq7x") // Err - lowercase
/// validate_room_code("BQIX") // Err - ambiguous glyph
/// ```
pub fn validate_room_code(code: &str) -> Result<(), ValidationError> {
    if code.len() != ROOM_CODE_LENGTH {
        let mut err = ValidationError::new("room_code_length");
        err.message = Some(
            format!(
                "Room code must be exactly {} characters (got {})",
                ROOM_CODE_LENGTH,
                code.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !code.bytes().all(|byte| ROOM_CODE_ALPHABET.contains(&byte)) {
        let mut err = ValidationError::new("room_code_format");
        err.message = Some("Room code must contain only unambiguous uppercase characters".into());
        return Err(err);
    }

    Ok(())
}

/// Maximum length of a display name.
const DISPLAY_NAME_MAX: usize = 24;

/// Validates that a display name is non-blank and reasonably short.
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        let mut err = ValidationError::new("display_name_blank");
        err.message = Some("Display name must not be blank".into());
        return Err(err);
    }

    if name.chars().count() > DISPLAY_NAME_MAX {
        let mut err = ValidationError::new("display_name_length");
        err.message =
            Some(format!("Display name must be at most {DISPLAY_NAME_MAX} characters").into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_room_code_valid() {
        assert!(validate_room_code("BQ7X").is_ok());
        assert!(validate_room_code("ZZZZ").is_ok());
        assert!(validate_room_code("A234").is_ok());
    }

    #[test]
    fn test_validate_room_code_invalid_length() {
        assert!(validate_room_code("BQ7").is_err()); // too short
        assert!(validate_room_code("BQ7XY").is_err()); // too long
        assert!(validate_room_code("").is_err()); // empty
    }

    #[test]
    fn test_validate_room_code_invalid_format() {
        assert!(validate_room_code("bq7x").is_err()); // lowercase
        assert!(validate_room_code("BQIX").is_err()); // ambiguous I
        assert!(validate_room_code("BQ0X").is_err()); // ambiguous 0
        assert!(validate_room_code("BQ X").is_err()); // space
    }

    #[test]
    fn test_validate_display_name() {
        assert!(validate_display_name("Ada").is_ok());
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"x".repeat(25)).is_err());
    }
}
