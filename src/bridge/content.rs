use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use crate::error::BridgeError;
use crate::media::MediaResolver;
use crate::parsers::{MarkupRewriter, MessageUtils, RewriteContext, TextFormat};

/// A message as delivered by the remote platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMessage {
    pub plain_text: String,
    pub rich_text: Option<String>,
    /// The "/me did X" convention.
    pub is_status_message: bool,
    pub author_username: Option<String>,
    /// Remote username to remote user id, for each mention in the message.
    pub mentions: HashMap<String, String>,
    /// Media references in `<server>/<media_id>` form.
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Emote,
}

impl MessageType {
    pub fn msgtype(self) -> &'static str {
        match self {
            MessageType::Text => "m.text",
            MessageType::Emote => "m.emote",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedContent {
    pub plain_body: String,
    pub formatted_body: String,
    pub message_type: MessageType,
}

impl TransformedContent {
    pub fn to_event_content(&self) -> Value {
        json!({
            "msgtype": self.message_type.msgtype(),
            "body": self.plain_body,
            "format": "org.matrix.custom.html",
            "formatted_body": self.formatted_body,
        })
    }
}

pub struct ContentTransformer {
    rewriter: Arc<dyn MarkupRewriter>,
    media: Arc<MediaResolver>,
}

impl ContentTransformer {
    pub fn new(rewriter: Arc<dyn MarkupRewriter>, media: Arc<MediaResolver>) -> Self {
        Self { rewriter, media }
    }

    /// Deterministic: the same message and context always give the same output.
    pub fn transform(
        &self,
        message: &RemoteMessage,
        ctx: &RewriteContext,
    ) -> Result<TransformedContent, BridgeError> {
        let plain_text = self.strip_status_prefix(message, &message.plain_text);

        let mut plain_body = self
            .rewriter
            .rewrite(plain_text, TextFormat::Plain, ctx)
            .unwrap_or_else(|| plain_text.to_string());

        let rich = message
            .rich_text
            .as_deref()
            .map(|rich| self.strip_status_prefix(message, rich))
            .and_then(|rich| self.rewriter.rewrite(rich, TextFormat::Html, ctx));
        let mut formatted_body = match rich {
            Some(html) => html,
            None => {
                if message.rich_text.is_some() {
                    debug!(
                        "rich text not translatable, using escaped plain text room={}",
                        ctx.matrix_room_id
                    );
                }
                MessageUtils::plain_to_html(plain_text)
            }
        };

        for attachment in &message.attachments {
            let url = self.media.resolve_media_reference(attachment)?;
            append_line(&mut plain_body, &url);
            let link = format!(
                "<a href=\"{0}\">{0}</a>",
                MessageUtils::escape_html(&url)
            );
            if formatted_body.is_empty() {
                formatted_body = link;
            } else {
                formatted_body.push_str("<br>");
                formatted_body.push_str(&link);
            }
        }

        let message_type = if message.is_status_message {
            MessageType::Emote
        } else {
            MessageType::Text
        };

        Ok(TransformedContent {
            plain_body,
            formatted_body,
            message_type,
        })
    }

    fn strip_status_prefix<'a>(&self, message: &RemoteMessage, text: &'a str) -> &'a str {
        match (message.is_status_message, message.author_username.as_deref()) {
            (true, Some(author)) => MessageUtils::strip_author_prefix(text, author),
            _ => text,
        }
    }
}

fn append_line(body: &mut String, line: &str) {
    if !body.is_empty() {
        body.push('\n');
    }
    body.push_str(line);
}
