use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TRAILING_SPACES: Regex =
        Regex::new(r"(?m)[ \t]+(\r?)$").expect("Invalid TRAILING_SPACES regex pattern");
}

/// Text rewrites applied right before a document is encoded and written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveTransforms {
    pub remove_trailing_spaces: bool,
    pub append_empty_line: bool,
}

impl SaveTransforms {
    pub fn apply(&self, text: &str) -> String {
        let mut out = if self.remove_trailing_spaces {
            remove_trailing_spaces(text)
        } else {
            text.to_string()
        };
        if self.append_empty_line {
            ensure_trailing_newline(&mut out);
        }
        out
    }

    pub fn is_noop(&self) -> bool {
        !self.remove_trailing_spaces && !self.append_empty_line
    }
}

pub fn remove_trailing_spaces(text: &str) -> String {
    TRAILING_SPACES.replace_all(text, "${1}").into_owned()
}

/// Appends a line break to non-empty text that does not end with one, using
/// CRLF when the text already does.
pub fn ensure_trailing_newline(text: &mut String) {
    if text.is_empty() || text.ends_with('\n') {
        return;
    }
    text.push_str(line_ending(text));
}

pub fn line_ending(text: &str) -> &'static str {
    if text.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}
