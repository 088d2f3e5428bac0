//! Parsing of inbound gateway webhooks.

use std::collections::HashMap;

/// First media attachment of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Address as the gateway sent it, e.g. `whatsapp:+201234567890`
    pub sender: String,
    /// Normalized `+E164` form used as the session and log key
    pub user_key: String,
    pub message_id: String,
    pub body: String,
    /// Only attachment 0 is ever used
    pub media: Option<MediaRef>,
}

/// Strip the channel prefix and any formatting from a sender address.
///
/// `whatsapp:+20 123-456` becomes `+20123456`. Returns `None` when no digits
/// remain.
pub fn user_key_from_sender(sender: &str) -> Option<String> {
    let address = sender.rsplit(':').next().unwrap_or(sender);
    let digits: String = address.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("+{}", digits))
    }
}

/// Mask all but the last four digits, for log lines.
pub fn mask_user_key(user_key: &str) -> String {
    let count = user_key.chars().count();
    if count <= 4 {
        return "****".to_string();
    }
    let visible: String = user_key.chars().skip(count - 4).collect();
    format!("***{}", visible)
}

impl InboundMessage {
    /// Build from decoded webhook parameters (`From`, `Body`, `MessageSid`,
    /// `NumMedia`, `MediaUrl0`, `MediaContentType0`).
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, String> {
        let get = |key: &str| params.get(key).map(|v| v.trim()).unwrap_or_default();

        let sender = get("From");
        if sender.is_empty() {
            return Err("missing 'From'".to_string());
        }
        let user_key = user_key_from_sender(sender).ok_or_else(|| format!("unusable sender address '{}'", sender))?;

        let num_media: u32 = get("NumMedia").parse().unwrap_or(0);
        let media_url = get("MediaUrl0");
        let media = if num_media > 0 && !media_url.is_empty() {
            Some(MediaRef {
                url: media_url.to_string(),
                content_type: get("MediaContentType0").to_string(),
            })
        } else {
            None
        };

        let body = get("Body");
        if body.is_empty() && media.is_none() {
            return Err("message has neither text nor media".to_string());
        }

        Ok(Self {
            sender: sender.to_string(),
            user_key,
            message_id: get("MessageSid").to_string(),
            body: body.to_string(),
            media,
        })
    }

    /// Whether this message should take the voice path.
    pub fn is_voice(&self) -> bool {
        self.media
            .as_ref()
            .is_some_and(|m| m.content_type.to_ascii_lowercase().starts_with("audio/") || m.content_type.is_empty())
    }
}
