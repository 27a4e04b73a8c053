pub struct MessageUtils;

impl MessageUtils {
    pub fn escape_html(text: &str) -> String {
        let mut escaped = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '&' => escaped.push_str("&amp;"),
                '<' => escaped.push_str("&lt;"),
                '>' => escaped.push_str("&gt;"),
                '"' => escaped.push_str("&quot;"),
                '\'' => escaped.push_str("&#39;"),
                _ => escaped.push(c),
            }
        }
        escaped
    }

    /// Escaped HTML rendering of plain text, newlines as `<br>`.
    pub fn plain_to_html(text: &str) -> String {
        Self::escape_html(text).replace("\r\n", "\n").replace('\n', "<br>")
    }

    /// Removes a leading `@author ` the remote platform prepends to status messages.
    pub fn strip_author_prefix<'a>(text: &'a str, author_username: &str) -> &'a str {
        text.strip_prefix('@')
            .and_then(|rest| rest.strip_prefix(author_username))
            .and_then(|rest| rest.strip_prefix(' '))
            .unwrap_or(text)
    }

    pub fn preview_text(text: &str) -> String {
        const MAX_CHARS: usize = 120;
        let mut preview: String = text.chars().take(MAX_CHARS).collect();
        if text.chars().count() > MAX_CHARS {
            preview.push_str("...");
        }
        preview.replace('\n', "\\n")
    }
}
