//! Pre-send checks. Anything rejected here never reaches a transport.

use shared::domain::InlineButton;
use url::Url;

use crate::{error::ValidationError, PostDraft};

/// Returns the trimmed `@username` to send.
pub fn channel_username(raw: &str) -> Result<String, ValidationError> {
    let username = raw.trim();
    if username.is_empty() {
        return Err(ValidationError::EmptyChannelName);
    }
    if !username.starts_with('@') || username.len() == 1 {
        return Err(ValidationError::ChannelNameFormat);
    }
    Ok(username.to_string())
}

pub fn inline_button(button: &InlineButton) -> Result<(), ValidationError> {
    if button.text.trim().is_empty() || button.url.trim().is_empty() {
        return Err(ValidationError::EmptyButton);
    }
    match Url::parse(button.url.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
        _ => Err(ValidationError::ButtonUrl(button.url.clone())),
    }
}

pub fn post_draft(draft: &PostDraft, has_media: bool) -> Result<(), ValidationError> {
    if draft.text.trim().is_empty() && !has_media {
        return Err(ValidationError::EmptyPost);
    }
    draft.inline_buttons.iter().try_for_each(inline_button)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use shared::domain::ChannelId;

    use super::*;

    fn button(text: &str, url: &str) -> InlineButton {
        InlineButton {
            text: text.into(),
            url: url.into(),
        }
    }

    #[test]
    fn channel_username_is_trimmed_and_needs_at_sign() {
        assert_eq!(channel_username("  @news \n").as_deref(), Ok("@news"));
        assert_eq!(channel_username("   "), Err(ValidationError::EmptyChannelName));
        assert_eq!(channel_username("news"), Err(ValidationError::ChannelNameFormat));
        assert_eq!(channel_username("@"), Err(ValidationError::ChannelNameFormat));
    }

    #[test]
    fn button_urls_must_be_http_or_https() {
        assert!(inline_button(&button("Site", "https://example.com/a")).is_ok());
        assert!(inline_button(&button("Site", "http://example.com")).is_ok());
        assert_eq!(
            inline_button(&button("Site", "ftp://example.com")),
            Err(ValidationError::ButtonUrl("ftp://example.com".into()))
        );
        assert_eq!(
            inline_button(&button("Site", "https//broken")),
            Err(ValidationError::ButtonUrl("https//broken".into()))
        );
        assert_eq!(
            inline_button(&button(" ", "https://example.com")),
            Err(ValidationError::EmptyButton)
        );
    }

    #[test]
    fn media_alone_is_enough_for_a_post() {
        let draft = PostDraft {
            channel_id: ChannelId(1),
            text: String::new(),
            schedule_time: Utc::now(),
            inline_buttons: Vec::new(),
        };
        assert_eq!(post_draft(&draft, false), Err(ValidationError::EmptyPost));
        assert_eq!(post_draft(&draft, true), Ok(()));
    }
}
