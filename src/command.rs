//! Slash-command text parsing.
//!
//! Chat clients HTML-escape `&`, `<` and `>` and users often wrap snippets in
//! inline or triple backtick fences; both are undone here.

use crate::error::ValidationError;
use crate::registry::LanguageRegistry;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub language_key: String,
    pub code: String,
}

/// Parses `"<language> <code>"`. An empty `code` means the caller should be asked
/// for input interactively.
pub fn parse(raw_text: &str, registry: &LanguageRegistry) -> Result<ParsedCommand, ValidationError> {
    let (language_key, code) = split_command(raw_text);
    let code = unescape_entities(code);
    let code = strip_fence(&code).to_string();

    if registry.get(language_key).is_none() {
        return Err(ValidationError::UnsupportedLanguage(language_key.to_string()));
    }

    debug!(language = language_key, code = %code, "Parsed command");
    Ok(ParsedCommand {
        language_key: language_key.to_string(),
        code,
    })
}

/// Splits trimmed text on its first space.
pub fn split_command(raw_text: &str) -> (&str, &str) {
    let trimmed = raw_text.trim();
    match trimmed.split_once(' ') {
        Some((language, code)) => (language, code),
        None => (trimmed, ""),
    }
}

/// Decodes `&amp;`, `&lt;` and `&gt;` in one left-to-right pass, so decoded text
/// is never decoded again (`&amp;lt;` becomes `&lt;`).
pub fn unescape_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let (decoded, len) = if rest.starts_with("&amp;") {
            ('&', 5)
        } else if rest.starts_with("&lt;") {
            ('<', 4)
        } else if rest.starts_with("&gt;") {
            ('>', 4)
        } else {
            ('&', 1)
        };
        out.push(decoded);
        rest = &rest[len..];
    }
    out.push_str(rest);
    out
}

/// Removes a symmetric backtick fence when it is exactly one or exactly three
/// characters wide. Other widths are left alone.
pub fn strip_fence(code: &str) -> &str {
    let bytes = code.as_bytes();
    let (mut start, mut end) = (0, bytes.len());
    while start < end && bytes[start] == b'`' && bytes[end - 1] == b'`' {
        start += 1;
        end -= 1;
    }
    if (start == 1 || start == 3) && start <= end {
        &code[start..end]
    } else {
        code
    }
}
