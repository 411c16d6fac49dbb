use std::sync::OnceLock;

use regex::Regex;

use crate::config::ValidationConfig;
use crate::error::{Result, SyncError};
use crate::models::{ContentKind, MediaReference, MessageContent};

fn invalid(message: impl Into<String>) -> SyncError {
    SyncError::Validation(message.into())
}

fn mime_type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^[a-z]+/[a-z0-9][a-z0-9.+\-]*$").unwrap()
    })
}

/// Validation utilities for input sanitization and edge case handling
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Validate an identifier (thread, user, tenant)
    pub fn validate_id(field: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(invalid(format!("{field} cannot be empty")));
        }

        if value.len() > 128 {
            return Err(invalid(format!("{field} too long (max 128 characters)")));
        }

        // Check for potentially dangerous characters
        if value.chars().any(char::is_control) {
            return Err(invalid(format!("{field} contains invalid characters")));
        }

        Ok(())
    }

    /// Validate a text body
    pub fn validate_text(text: &str, max_length: usize) -> Result<()> {
        if text.trim().is_empty() {
            return Err(invalid("Message text cannot be empty"));
        }

        let length = text.chars().count();
        if length > max_length {
            return Err(invalid(format!("Message text too long ({length} characters, max {max_length})")));
        }

        Ok(())
    }

    /// Validate a media reference: voice or image, http(s) URL, well-formed MIME type
    pub fn validate_media(media: &MediaReference, max_bytes: u64) -> Result<()> {
        if !media.kind.is_media() {
            return Err(invalid(format!("Content kind {} is not a media kind", media.kind.as_str())));
        }

        Self::validate_url(&media.url)?;
        Self::validate_mime_type(&media.mime_type)?;

        let expected_prefix = match media.kind {
            ContentKind::Voice => "audio/",
            _ => "image/",
        };
        if !media.mime_type.starts_with(expected_prefix) {
            return Err(invalid(format!(
                "MIME type {} does not match {} content",
                media.mime_type,
                media.kind.as_str()
            )));
        }

        if let Some(size) = media.size_bytes {
            if size == 0 {
                return Err(invalid("Media size must be positive"));
            }
            if size > max_bytes {
                return Err(invalid(format!("Media too large ({size} bytes, max {max_bytes})")));
            }
        }

        if media.kind == ContentKind::Image && media.duration_ms.is_some() {
            return Err(invalid("Images cannot carry a duration"));
        }

        Ok(())
    }

    /// Validate any outbound message body
    pub fn validate_content(content: &MessageContent, limits: &ValidationConfig) -> Result<()> {
        match content {
            MessageContent::Text(text) | MessageContent::System(text) => {
                Self::validate_text(text, limits.max_text_length)
            },
            MessageContent::Media(media) => Self::validate_media(media, limits.max_media_bytes),
        }
    }

    /// Validate a media URL
    pub fn validate_url(url: &str) -> Result<()> {
        if url.trim().is_empty() {
            return Err(invalid("Media URL cannot be empty"));
        }

        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(invalid("Media URL must use http or https"));
        }

        if url.len() > 2048 {
            return Err(invalid("Media URL too long (max 2048 characters)"));
        }

        if url.chars().any(char::is_whitespace) {
            return Err(invalid("Media URL cannot contain whitespace"));
        }

        Ok(())
    }

    /// Validate a MIME type such as `audio/mp4` or `image/png`
    pub fn validate_mime_type(mime_type: &str) -> Result<()> {
        if mime_type.trim().is_empty() {
            return Err(invalid("MIME type cannot be empty"));
        }

        if !mime_type_pattern().is_match(mime_type) {
            return Err(invalid(format!("Malformed MIME type: {mime_type}")));
        }

        Ok(())
    }

    /// Sanitize text input
    #[must_use]
    pub fn sanitize_text(text: &str) -> String {
        text.chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
            .collect::<String>()
            .trim()
            .to_string()
    }

    /// Sanitize the text part of a message body; media references are left untouched
    #[must_use]
    pub fn sanitize_content(content: MessageContent) -> MessageContent {
        match content {
            MessageContent::Text(text) => MessageContent::Text(Self::sanitize_text(&text)),
            MessageContent::System(text) => MessageContent::System(Self::sanitize_text(&text)),
            media @ MessageContent::Media(_) => media,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_characters_are_stripped_but_newlines_kept() {
        assert_eq!(InputValidator::sanitize_text("  hi\u{7}\nthere "), "hi\nthere");
    }

    #[test]
    fn mime_pattern_rejects_missing_subtype() {
        assert!(InputValidator::validate_mime_type("audio/").is_err());
        assert!(InputValidator::validate_mime_type("audio/x-m4a").is_ok());
    }
}
