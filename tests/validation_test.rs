//! Unit tests for validation.rs module

use convo_sync::config::ValidationConfig;
use convo_sync::models::{ContentKind, MediaReference, MessageContent};
use convo_sync::validation::InputValidator;
use convo_sync::SyncError;

fn voice_note() -> MediaReference {
    MediaReference {
        kind: ContentKind::Voice,
        url: "https://media.example.com/voice/abc123.m4a".to_string(),
        mime_type: "audio/mp4".to_string(),
        size_bytes: Some(48_000),
        duration_ms: Some(6_500),
    }
}

fn photo() -> MediaReference {
    MediaReference {
        kind: ContentKind::Image,
        url: "https://media.example.com/img/field-trip.jpg".to_string(),
        mime_type: "image/jpeg".to_string(),
        size_bytes: Some(1_200_000),
        duration_ms: None,
    }
}

#[test]
fn test_validate_id_valid() {
    assert!(InputValidator::validate_id("thread_id", "thread-42").is_ok());
    assert!(InputValidator::validate_id("user_id", "7f3c2a1e-uuid-like").is_ok());
}

#[test]
fn test_validate_id_empty() {
    assert!(InputValidator::validate_id("thread_id", "").is_err());
}

#[test]
fn test_validate_id_whitespace_only() {
    assert!(InputValidator::validate_id("thread_id", "   ").is_err());
}

#[test]
fn test_validate_id_too_long() {
    let long_id = "a".repeat(129);
    assert!(InputValidator::validate_id("user_id", &long_id).is_err());
}

#[test]
fn test_validate_id_exactly_128_chars() {
    let id = "a".repeat(128);
    assert!(InputValidator::validate_id("user_id", &id).is_ok());
}

#[test]
fn test_validate_id_with_control_chars() {
    assert!(InputValidator::validate_id("user_id", "user\0one").is_err());
    assert!(InputValidator::validate_id("user_id", "user\none").is_err());
}

#[test]
fn test_validate_id_error_names_the_field() {
    let err = InputValidator::validate_id("tenant_id", "").unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert!(err.to_string().contains("tenant_id"));
}

#[test]
fn test_validate_text_valid() {
    assert!(InputValidator::validate_text("See you at pickup", 100).is_ok());
}

#[test]
fn test_validate_text_empty_and_blank() {
    assert!(InputValidator::validate_text("", 100).is_err());
    assert!(InputValidator::validate_text(" \n\t ", 100).is_err());
}

#[test]
fn test_validate_text_length_counts_characters() {
    let accented = "é".repeat(10);
    assert!(InputValidator::validate_text(&accented, 10).is_ok());
    assert!(InputValidator::validate_text(&accented, 9).is_err());
}

#[test]
fn test_validate_text_unicode() {
    assert!(InputValidator::validate_text("¡Gracias, señora García! 🎉", 100).is_ok());
}

#[test]
fn test_validate_media_voice_note() {
    assert!(InputValidator::validate_media(&voice_note(), 25 * 1024 * 1024).is_ok());
}

#[test]
fn test_validate_media_image() {
    assert!(InputValidator::validate_media(&photo(), 25 * 1024 * 1024).is_ok());
}

#[test]
fn test_validate_media_rejects_text_kind() {
    let mut media = voice_note();
    media.kind = ContentKind::Text;
    assert!(InputValidator::validate_media(&media, u64::MAX).is_err());
}

#[test]
fn test_validate_media_mime_must_match_kind() {
    let mut media = voice_note();
    media.mime_type = "image/png".to_string();
    assert!(InputValidator::validate_media(&media, u64::MAX).is_err());

    let mut media = photo();
    media.mime_type = "audio/mpeg".to_string();
    assert!(InputValidator::validate_media(&media, u64::MAX).is_err());
}

#[test]
fn test_validate_media_size_limits() {
    let mut media = photo();
    media.size_bytes = Some(0);
    assert!(InputValidator::validate_media(&media, 10).is_err());

    media.size_bytes = Some(11);
    assert!(InputValidator::validate_media(&media, 10).is_err());

    media.size_bytes = Some(10);
    assert!(InputValidator::validate_media(&media, 10).is_ok());

    media.size_bytes = None;
    assert!(InputValidator::validate_media(&media, 10).is_ok());
}

#[test]
fn test_validate_media_image_cannot_have_duration() {
    let mut media = photo();
    media.duration_ms = Some(1_000);
    assert!(InputValidator::validate_media(&media, u64::MAX).is_err());
}

#[test]
fn test_validate_url_schemes() {
    assert!(InputValidator::validate_url("https://cdn.example.com/a.jpg").is_ok());
    assert!(InputValidator::validate_url("http://localhost:9000/a.jpg").is_ok());
    assert!(InputValidator::validate_url("ftp://cdn.example.com/a.jpg").is_err());
    assert!(InputValidator::validate_url("file:///etc/passwd").is_err());
    assert!(InputValidator::validate_url("").is_err());
}

#[test]
fn test_validate_url_whitespace_and_length() {
    assert!(InputValidator::validate_url("https://cdn.example.com/my photo.jpg").is_err());
    let long_url = format!("https://cdn.example.com/{}", "a".repeat(2048));
    assert!(InputValidator::validate_url(&long_url).is_err());
}

#[test]
fn test_validate_mime_type() {
    assert!(InputValidator::validate_mime_type("audio/mp4").is_ok());
    assert!(InputValidator::validate_mime_type("audio/x-m4a").is_ok());
    assert!(InputValidator::validate_mime_type("image/svg+xml").is_ok());
    assert!(InputValidator::validate_mime_type("").is_err());
    assert!(InputValidator::validate_mime_type("audio").is_err());
    assert!(InputValidator::validate_mime_type("Audio/MP4").is_err());
    assert!(InputValidator::validate_mime_type("audio/mp4; codecs=aac").is_err());
}

#[test]
fn test_validate_content_dispatches_on_variant() {
    let limits = ValidationConfig {
        max_text_length: 5,
        max_media_bytes: 100,
    };

    assert!(InputValidator::validate_content(&MessageContent::Text("hello".into()), &limits).is_ok());
    assert!(InputValidator::validate_content(&MessageContent::Text("hello!".into()), &limits).is_err());
    assert!(InputValidator::validate_content(&MessageContent::System("joined".into()), &limits).is_err());
    assert!(InputValidator::validate_content(&MessageContent::Media(voice_note()), &limits).is_err());

    let mut small = voice_note();
    small.size_bytes = Some(100);
    assert!(InputValidator::validate_content(&MessageContent::Media(small), &limits).is_ok());
}

#[test]
fn test_sanitize_text_strips_controls() {
    assert_eq!(InputValidator::sanitize_text("Hello\0World"), "HelloWorld");
    assert_eq!(InputValidator::sanitize_text("Line 1\nLine 2\tTabbed"), "Line 1\nLine 2\tTabbed");
}

#[test]
fn test_sanitize_text_trims() {
    assert_eq!(InputValidator::sanitize_text("   padded   "), "padded");
    assert_eq!(InputValidator::sanitize_text("\u{1b}\u{7}"), "");
}

#[test]
fn test_sanitize_content_leaves_media_alone() {
    let media = MessageContent::Media(voice_note());
    assert_eq!(InputValidator::sanitize_content(media.clone()), media);

    let text = InputValidator::sanitize_content(MessageContent::Text("  hi\u{0} ".into()));
    assert_eq!(text, MessageContent::Text("hi".into()));
}
