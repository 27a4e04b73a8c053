use std::collections::HashMap;

use regex::{Captures, Regex};

use super::common::MessageUtils;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    Html,
}

/// What a rewrite may need to know about the message it is rewriting.
#[derive(Debug, Clone, Default)]
pub struct RewriteContext {
    pub matrix_room_id: String,
    /// Remote username to Matrix user id, for mentions in this message.
    pub known_users: HashMap<String, String>,
}

/// Translates remote markup conventions into their Matrix equivalents.
pub trait MarkupRewriter: Send + Sync {
    /// `None` means the text contains markup that cannot be translated.
    fn rewrite(&self, text: &str, format: TextFormat, ctx: &RewriteContext) -> Option<String>;
}

const ALLOWED_TAGS: &[&str] = &[
    "a", "b", "blockquote", "br", "code", "del", "em", "i", "li", "ol", "p", "pre", "s",
    "strike", "strong", "u", "ul",
];

const EMOJI_SHORTCODES: &[(&str, &str)] = &[
    ("heart", "\u{2764}\u{fe0f}"),
    ("joy", "\u{1f602}"),
    ("laughing", "\u{1f606}"),
    ("slight_smile", "\u{1f642}"),
    ("smile", "\u{1f604}"),
    ("tada", "\u{1f389}"),
    ("thumbsdown", "\u{1f44e}"),
    ("thumbsup", "\u{1f44d}"),
    ("wave", "\u{1f44b}"),
    ("wink", "\u{1f609}"),
];

const LINK_SCHEMES: &[&str] = &["http:", "https:", "mailto:"];

/// Mentions, emoji shortcodes and an HTML tag allowlist.
pub struct DefaultMarkupRewriter {
    mention: Regex,
    shortcode: Regex,
    tag: Regex,
    attribute: Regex,
}

impl DefaultMarkupRewriter {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            mention: Regex::new(r"(^|[\s>(])@([A-Za-z0-9_.-]+)")?,
            shortcode: Regex::new(r":([a-z0-9_+-]+):")?,
            tag: Regex::new(r"<(/?)([A-Za-z][A-Za-z0-9]*)\b([^>]*)>")?,
            attribute: Regex::new(
                r#"([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#,
            )?,
        })
    }

    fn only_allowed_tags(&self, html: &str) -> bool {
        self.tag.captures_iter(html).all(|caps| {
            let name = caps[2].to_ascii_lowercase();
            ALLOWED_TAGS.contains(&name.as_str())
                && self.allowed_attributes(&name, !caps[1].is_empty(), &caps[3])
        })
    }

    /// Only `<a href>` with a web or mail link may carry an attribute.
    fn allowed_attributes(&self, tag: &str, closing: bool, attributes: &str) -> bool {
        let attributes = attributes.trim().trim_end_matches('/').trim_end();
        if attributes.is_empty() {
            return true;
        }
        if closing || tag != "a" {
            return false;
        }
        if !self.attribute.replace_all(attributes, "").trim().is_empty() {
            return false;
        }

        self.attribute.captures_iter(attributes).all(|caps| {
            let value = caps.get(2).or(caps.get(3)).or(caps.get(4));
            caps[1].eq_ignore_ascii_case("href")
                && value.is_some_and(|value| {
                    let link = value.as_str().trim().to_ascii_lowercase();
                    LINK_SCHEMES.iter().any(|scheme| link.starts_with(scheme))
                })
        })
    }

    fn replace_shortcodes(&self, text: &str) -> String {
        self.shortcode
            .replace_all(text, |caps: &Captures| {
                EMOJI_SHORTCODES
                    .iter()
                    .find(|(code, _)| *code == &caps[1])
                    .map(|(_, emoji)| (*emoji).to_string())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    fn link_mentions(&self, html: &str, ctx: &RewriteContext) -> String {
        self.mention
            .replace_all(html, |caps: &Captures| match ctx.known_users.get(&caps[2]) {
                Some(matrix_user_id) => format!(
                    "{}<a href=\"https://matrix.to/#/{}\">@{}</a>",
                    &caps[1],
                    matrix_user_id,
                    MessageUtils::escape_html(&caps[2])
                ),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

impl MarkupRewriter for DefaultMarkupRewriter {
    fn rewrite(&self, text: &str, format: TextFormat, ctx: &RewriteContext) -> Option<String> {
        match format {
            TextFormat::Plain => Some(self.replace_shortcodes(text)),
            TextFormat::Html => {
                if !self.only_allowed_tags(text) {
                    return None;
                }
                Some(self.link_mentions(&self.replace_shortcodes(text), ctx))
            }
        }
    }
}
