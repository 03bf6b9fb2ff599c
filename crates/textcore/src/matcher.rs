use regex::{NoExpand, Regex, RegexBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("search text is empty")]
    Empty,
    #[error("invalid regular expression: {0}")]
    Invalid(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
    pub case_sensitive: bool,
    pub whole_word: bool,
    pub regex: bool,
}

/// Outcome of a replace-all over one piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaced {
    pub text: String,
    pub count: usize,
}

/// Compiled find/replace needle.
#[derive(Debug, Clone)]
pub struct SearchPattern {
    regex: Regex,
    expand_groups: bool,
}

impl SearchPattern {
    pub fn new(needle: &str, options: MatchOptions) -> Result<Self, PatternError> {
        if needle.is_empty() {
            return Err(PatternError::Empty);
        }
        let mut source = if options.regex {
            needle.to_string()
        } else {
            regex::escape(needle)
        };
        if options.whole_word {
            source = format!(r"\b(?:{source})\b");
        }
        let regex = RegexBuilder::new(&source)
            .case_insensitive(!options.case_sensitive)
            .multi_line(true)
            .build()?;
        Ok(Self {
            regex,
            expand_groups: options.regex,
        })
    }

    pub fn literal(needle: &str) -> Result<Self, PatternError> {
        Self::new(
            needle,
            MatchOptions {
                case_sensitive: true,
                ..MatchOptions::default()
            },
        )
    }

    pub fn count(&self, text: &str) -> usize {
        self.regex.find_iter(text).count()
    }

    /// Replaces every match. `$1`-style group references are only expanded
    /// for regex patterns; literal replacements are inserted verbatim.
    pub fn replace_all(&self, text: &str, replacement: &str) -> Replaced {
        let count = self.count(text);
        if count == 0 {
            return Replaced {
                text: text.to_string(),
                count,
            };
        }
        let replaced = if self.expand_groups {
            self.regex.replace_all(text, replacement)
        } else {
            self.regex.replace_all(text, NoExpand(replacement))
        };
        Replaced {
            text: replaced.into_owned(),
            count,
        }
    }
}
