//! Text encoding detection on load and enforcement on save.
//!
//! The resolver never substitutes characters: saving content that the target
//! encoding cannot represent fails with [`EncodingError::Unrepresentable`] and
//! the caller decides what to do (pick another encoding, fall back to UTF-8).

use encoding_rs::EncoderResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed set of encodings a document can be tagged with.
///
/// Persisted as its label. New encodings are appended; labels are never renamed.
/// Unknown labels read back as [`Encoding::Auto`] so older builds can still load
/// sessions written by newer ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Encoding {
    /// Detect on load, save as UTF-8.
    Auto,
    Utf8,
    Utf16,
    Iso8859_1,
    Windows1252,
    Cp1256,
    Koi8U,
    Gb18030,
    ShiftJis,
    EucJp,
    EucKr,
}

impl Encoding {
    pub const ALL: [Encoding; 11] = [
        Encoding::Auto,
        Encoding::Utf8,
        Encoding::Utf16,
        Encoding::Iso8859_1,
        Encoding::Windows1252,
        Encoding::Cp1256,
        Encoding::Koi8U,
        Encoding::Gb18030,
        Encoding::ShiftJis,
        Encoding::EucJp,
        Encoding::EucKr,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Encoding::Auto => "auto",
            Encoding::Utf8 => "UTF-8",
            Encoding::Utf16 => "UTF-16",
            Encoding::Iso8859_1 => "ISO-8859-1",
            Encoding::Windows1252 => "Windows-1252",
            Encoding::Cp1256 => "CP1256",
            Encoding::Koi8U => "KOI8-U",
            Encoding::Gb18030 => "GB18030",
            Encoding::ShiftJis => "Shift_JIS",
            Encoding::EucJp => "EUC-JP",
            Encoding::EucKr => "EUC-KR",
        }
    }

    /// Case-insensitive lookup accepting the common aliases.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace('_', "-");
        let encoding = match normalized.as_str() {
            "auto" | "unicode" => Encoding::Auto,
            "utf-8" | "utf8" => Encoding::Utf8,
            "utf-16" | "utf16" | "utf-16le" | "utf-16be" | "ucs-2" => Encoding::Utf16,
            "iso-8859-1" | "latin1" | "latin-1" | "iso8859-1" => Encoding::Iso8859_1,
            "windows-1252" | "cp1252" => Encoding::Windows1252,
            "cp1256" | "windows-1256" => Encoding::Cp1256,
            "koi8-u" | "koi8u" => Encoding::Koi8U,
            "gb18030" | "gbk" | "gb2312" => Encoding::Gb18030,
            "shift-jis" | "sjis" | "ms-kanji" | "windows-31j" => Encoding::ShiftJis,
            "euc-jp" => Encoding::EucJp,
            "euc-kr" | "cp949" => Encoding::EucKr,
            _ => return None,
        };
        Some(encoding)
    }

    /// Every byte below 0x80 means the same ASCII character.
    pub fn is_ascii_compatible(self) -> bool {
        !matches!(self, Encoding::Utf16)
    }

    fn codec(self) -> Option<&'static encoding_rs::Encoding> {
        match self {
            Encoding::Windows1252 => Some(encoding_rs::WINDOWS_1252),
            Encoding::Cp1256 => Some(encoding_rs::WINDOWS_1256),
            Encoding::Koi8U => Some(encoding_rs::KOI8_U),
            Encoding::Gb18030 => Some(encoding_rs::GB18030),
            Encoding::ShiftJis => Some(encoding_rs::SHIFT_JIS),
            Encoding::EucJp => Some(encoding_rs::EUC_JP),
            Encoding::EucKr => Some(encoding_rs::EUC_KR),
            Encoding::Auto | Encoding::Utf8 | Encoding::Utf16 | Encoding::Iso8859_1 => None,
        }
    }
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Utf8
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<String> for Encoding {
    fn from(label: String) -> Self {
        Encoding::from_label(&label).unwrap_or_else(|| {
            log::warn!("Unknown encoding label '{}', treating as auto", label);
            Encoding::Auto
        })
    }
}

impl From<Encoding> for String {
    fn from(encoding: Encoding) -> Self {
        encoding.label().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("character {character:?} at offset {char_offset} cannot be encoded as {encoding}")]
    Unrepresentable {
        encoding: Encoding,
        character: char,
        char_offset: usize,
    },
    #[error("could not determine a text encoding; the content looks binary")]
    Undetectable,
}

/// Result of [`EncodingResolver::detect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub encoding: Encoding,
    pub confident: bool,
}

/// Decoded file content together with what was learned while decoding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    pub encoding: Encoding,
    pub confident: bool,
    /// Malformed sequences were replaced with U+FFFD.
    pub lossy: bool,
}

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16LE_BOM: &[u8] = &[0xFF, 0xFE];
const UTF16BE_BOM: &[u8] = &[0xFE, 0xFF];

/// Detects encodings on load and enforces them on save.
///
/// Holds the process-wide fallback used when detection is inconclusive.
#[derive(Debug, Clone, Copy)]
pub struct EncodingResolver {
    default: Encoding,
}

impl EncodingResolver {
    pub fn new(default: Encoding) -> Self {
        let default = match default {
            Encoding::Auto => Encoding::Utf8,
            other => other,
        };
        Self { default }
    }

    pub fn default_encoding(&self) -> Encoding {
        self.default
    }

    /// Picks an encoding for `bytes`.
    ///
    /// An explicit override wins, then a byte-order mark, then heuristics.
    /// Inconclusive input yields the default with `confident = false`.
    pub fn detect(&self, bytes: &[u8], user_override: Option<Encoding>) -> Detection {
        if let Some(encoding) = user_override.filter(|e| *e != Encoding::Auto) {
            return Detection {
                encoding,
                confident: true,
            };
        }

        if bytes.starts_with(UTF8_BOM) {
            return Detection {
                encoding: Encoding::Utf8,
                confident: true,
            };
        }
        if bytes.starts_with(UTF16LE_BOM) || bytes.starts_with(UTF16BE_BOM) {
            return Detection {
                encoding: Encoding::Utf16,
                confident: true,
            };
        }

        if bytes.is_empty() {
            return self.inconclusive();
        }

        if looks_like_utf16(bytes) {
            return Detection {
                encoding: Encoding::Utf16,
                confident: false,
            };
        }

        if bytes.contains(&0) {
            return self.inconclusive();
        }

        match std::str::from_utf8(bytes) {
            Ok(text) if text.is_ascii() => Detection {
                encoding: if self.default.is_ascii_compatible() {
                    self.default
                } else {
                    Encoding::Utf8
                },
                confident: true,
            },
            Ok(_) => Detection {
                encoding: Encoding::Utf8,
                confident: true,
            },
            Err(_) => self.inconclusive(),
        }
    }

    fn inconclusive(&self) -> Detection {
        Detection {
            encoding: self.default,
            confident: false,
        }
    }

    /// Detects and decodes in one step, refusing content that looks binary.
    pub fn load(
        &self,
        bytes: &[u8],
        user_override: Option<Encoding>,
    ) -> Result<Decoded, EncodingError> {
        let detection = self.detect(bytes, user_override);
        if user_override.is_none()
            && detection.encoding != Encoding::Utf16
            && bytes.contains(&0)
        {
            return Err(EncodingError::Undetectable);
        }
        let (text, lossy) = decode(bytes, detection.encoding);
        if lossy {
            log::warn!(
                "Content decoded as {} contained malformed sequences",
                detection.encoding
            );
        }
        Ok(Decoded {
            text,
            encoding: detection.encoding,
            confident: detection.confident && !lossy,
            lossy,
        })
    }

    /// Fails if any character of `content` cannot be encoded losslessly.
    pub fn validate_for_save(&self, content: &str, encoding: Encoding) -> Result<(), EncodingError> {
        encode(content, encoding).map(|_| ())
    }

    /// Encodes `content` for writing, validating it first.
    pub fn encode_for_save(&self, content: &str, encoding: Encoding) -> Result<Vec<u8>, EncodingError> {
        encode(content, encoding)
    }
}

impl Default for EncodingResolver {
    fn default() -> Self {
        Self::new(Encoding::Utf8)
    }
}

/// Half or more of the odd (or even) bytes being NUL is a strong hint of
/// BOM-less UTF-16 text.
fn looks_like_utf16(bytes: &[u8]) -> bool {
    if bytes.len() < 4 || bytes.len() % 2 != 0 {
        return false;
    }
    let pairs = bytes.len() / 2;
    let odd_nuls = bytes.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    let even_nuls = bytes.iter().step_by(2).filter(|b| **b == 0).count();
    (odd_nuls * 2 >= pairs && even_nuls == 0) || (even_nuls * 2 >= pairs && odd_nuls == 0)
}

/// Decodes `bytes` as `encoding`, stripping a matching BOM. Returns the text and
/// whether replacement characters had to be inserted.
pub fn decode(bytes: &[u8], encoding: Encoding) -> (String, bool) {
    match encoding {
        Encoding::Auto | Encoding::Utf8 => {
            let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
            match std::str::from_utf8(body) {
                Ok(text) => (text.to_string(), false),
                Err(_) => (String::from_utf8_lossy(body).into_owned(), true),
            }
        }
        Encoding::Utf16 => {
            let (codec, body) = if let Some(rest) = bytes.strip_prefix(UTF16BE_BOM) {
                (encoding_rs::UTF_16BE, rest)
            } else if let Some(rest) = bytes.strip_prefix(UTF16LE_BOM) {
                (encoding_rs::UTF_16LE, rest)
            } else if bytes.len() >= 2 && bytes[0] == 0 && bytes[1] != 0 {
                (encoding_rs::UTF_16BE, bytes)
            } else {
                (encoding_rs::UTF_16LE, bytes)
            };
            let (text, had_errors) = codec.decode_without_bom_handling(body);
            (text.into_owned(), had_errors)
        }
        Encoding::Iso8859_1 => (bytes.iter().map(|b| char::from(*b)).collect(), false),
        other => match other.codec() {
            Some(codec) => {
                let (text, had_errors) = codec.decode_without_bom_handling(bytes);
                (text.into_owned(), had_errors)
            }
            None => (String::from_utf8_lossy(bytes).into_owned(), true),
        },
    }
}

/// Encodes `content` as `encoding` without any replacement.
///
/// UTF-16 output is little-endian with a BOM; UTF-8 output carries no BOM.
pub fn encode(content: &str, encoding: Encoding) -> Result<Vec<u8>, EncodingError> {
    match encoding {
        Encoding::Auto | Encoding::Utf8 => Ok(content.as_bytes().to_vec()),
        Encoding::Utf16 => {
            let mut out = Vec::with_capacity(2 + content.len() * 2);
            out.extend_from_slice(UTF16LE_BOM);
            for unit in content.encode_utf16() {
                out.extend_from_slice(&unit.to_le_bytes());
            }
            Ok(out)
        }
        Encoding::Iso8859_1 => {
            let mut out = Vec::with_capacity(content.len());
            for (char_offset, character) in content.chars().enumerate() {
                match u8::try_from(u32::from(character)) {
                    Ok(byte) => out.push(byte),
                    Err(_) => {
                        return Err(EncodingError::Unrepresentable {
                            encoding,
                            character,
                            char_offset,
                        })
                    }
                }
            }
            Ok(out)
        }
        other => match other.codec() {
            Some(codec) => encode_with_codec(codec, other, content),
            None => Ok(content.as_bytes().to_vec()),
        },
    }
}

fn encode_with_codec(
    codec: &'static encoding_rs::Encoding,
    encoding: Encoding,
    content: &str,
) -> Result<Vec<u8>, EncodingError> {
    let mut encoder = codec.new_encoder();
    let capacity = encoder
        .max_buffer_length_from_utf8_without_replacement(content.len())
        .unwrap_or(content.len() * 4);
    let mut out = Vec::with_capacity(capacity);
    let mut consumed = 0;

    loop {
        let (result, read) =
            encoder.encode_from_utf8_to_vec_without_replacement(&content[consumed..], &mut out, true);
        consumed += read;
        match result {
            EncoderResult::InputEmpty => return Ok(out),
            EncoderResult::OutputFull => {
                out.reserve((content.len() - consumed) * 4 + 16);
            }
            EncoderResult::Unmappable(character) => {
                let byte_offset = consumed.saturating_sub(character.len_utf8());
                let char_offset = content
                    .get(..byte_offset)
                    .map(|prefix| prefix.chars().count())
                    .unwrap_or(0);
                return Err(EncodingError::Unrepresentable {
                    encoding,
                    character,
                    char_offset,
                });
            }
        }
    }
}
