//! Language codes, pairs and source-text classification.
//!
//! Codes are ISO-639-1 plus `zt` (traditional Chinese). Parsing accepts the
//! common regional aliases clients send (`zh-CN`, `zh-TW`, `no`, `pt-BR`).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Source value that asks the gateway to identify the language itself.
pub const AUTO: &str = "auto";

/// Every language code the gateway knows about, sorted.
pub const KNOWN_CODES: &[&str] = &[
    "ar", "az", "bg", "bn", "ca", "cs", "da", "de", "el", "en", "eo", "es", "et", "eu", "fa",
    "fi", "fr", "ga", "gl", "he", "hi", "hu", "id", "it", "ja", "ko", "lt", "lv", "ms", "nb",
    "nl", "pl", "pt", "ro", "ru", "sk", "sl", "sq", "sv", "th", "tl", "tr", "uk", "ur", "vi",
    "zh", "zt",
];

static CODE_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2,3}(-[a-z]{2,4})?$").expect("valid code regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LanguageError {
    /// Well-formed code that is not in the known set.
    #[error("{0} is not a supported language")]
    Unsupported(String),
    /// Empty or syntactically invalid code.
    #[error("'{0}' is not a valid language code")]
    Malformed(String),
}

/// A known language code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct LanguageCode(&'static str);

// Hand-written (equivalent to `#[serde(try_from = "String")]`) because the derive
// would auto-borrow the `&'static str` field and only implement `Deserialize<'static>`.
impl<'de> Deserialize<'de> for LanguageCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl LanguageCode {
    pub fn parse(raw: &str) -> Result<Self, LanguageError> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        let canonical = match normalized.as_str() {
            "zh-cn" | "zh-hans" | "zh-sg" => "zh",
            "zh-tw" | "zh-hant" | "zh-hk" => "zt",
            "no" | "nn" => "nb",
            "pt-br" | "pt-pt" => "pt",
            "iw" => "he",
            "in" => "id",
            other => other,
        };

        if !CODE_SHAPE.is_match(canonical) {
            return Err(LanguageError::Malformed(raw.to_string()));
        }

        KNOWN_CODES
            .iter()
            .find(|code| **code == canonical)
            .map(|code| Self(code))
            .ok_or_else(|| LanguageError::Unsupported(raw.trim().to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl TryFrom<String> for LanguageCode {
    type Error = LanguageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LanguageCode> for String {
    fn from(code: LanguageCode) -> Self {
        code.0.to_string()
    }
}

/// Requested source language: a concrete code or auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLanguage {
    Auto,
    Code(LanguageCode),
}

impl SourceLanguage {
    pub fn parse(raw: &str) -> Result<Self, LanguageError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            AUTO | "detect" => Ok(Self::Auto),
            _ => LanguageCode::parse(raw).map(Self::Code),
        }
    }
}

/// Ordered (source, target) pair a model translates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LanguagePair {
    pub source: LanguageCode,
    pub target: LanguageCode,
}

impl LanguagePair {
    pub fn new(source: LanguageCode, target: LanguageCode) -> Self {
        Self { source, target }
    }

    /// Parse two raw codes into a pair.
    pub fn parse(source: &str, target: &str) -> Result<Self, LanguageError> {
        Ok(Self::new(LanguageCode::parse(source)?, LanguageCode::parse(target)?))
    }

    /// True when both codes are present in `allowlist`.
    pub fn within(&self, allowlist: &[LanguageCode]) -> bool {
        allowlist.contains(&self.source) && allowlist.contains(&self.target)
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

/// Whether `text` contains anything a model could translate.
///
/// Text made only of whitespace, emoji, pictographs, flags and variation
/// selectors is passed through untouched.
pub fn is_translatable(text: &str) -> bool {
    text.chars()
        .any(|ch| !ch.is_whitespace() && !is_pictographic(ch as u32))
}

fn is_pictographic(cp: u32) -> bool {
    matches!(
        cp,
        0x1F600..=0x1F64F // emoticons
            | 0x1F300..=0x1F5FF // misc symbols and pictographs
            | 0x1F680..=0x1F6FF // transport and map
            | 0x2600..=0x26FF // misc symbols
            | 0x2700..=0x27BF // dingbats
            | 0xFE00..=0xFE0F // variation selectors
            | 0x1F900..=0x1F9FF // supplemental symbols and pictographs
            | 0x1F1E6..=0x1F1FF // regional indicators
            | 0x20D0..=0x20FF // combining marks for symbols
            | 0x200D // zero width joiner
    )
}

/// Parse a comma-separated list of codes, e.g. an allowlist from the environment.
pub fn parse_code_list(raw: &str) -> Result<Vec<LanguageCode>, LanguageError> {
    let mut codes = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let code = LanguageCode::parse(part)?;
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(raw: &str) -> LanguageCode {
        LanguageCode::parse(raw).unwrap()
    }

    #[test]
    fn parses_known_codes_case_insensitively() {
        assert_eq!(code("EN").as_str(), "en");
        assert_eq!(code(" es ").as_str(), "es");
    }

    #[test]
    fn normalizes_regional_aliases() {
        assert_eq!(code("zh-CN").as_str(), "zh");
        assert_eq!(code("zh_TW").as_str(), "zt");
        assert_eq!(code("no").as_str(), "nb");
        assert_eq!(code("pt-BR").as_str(), "pt");
    }

    #[test]
    fn rejects_unknown_but_well_formed_code() {
        assert_eq!(
            LanguageCode::parse("xx"),
            Err(LanguageError::Unsupported("xx".to_string()))
        );
    }

    #[test]
    fn rejects_malformed_code() {
        assert!(matches!(LanguageCode::parse(""), Err(LanguageError::Malformed(_))));
        assert!(matches!(LanguageCode::parse("english"), Err(LanguageError::Malformed(_))));
        assert!(matches!(LanguageCode::parse("e1"), Err(LanguageError::Malformed(_))));
    }

    #[test]
    fn source_accepts_auto_and_detect() {
        assert_eq!(SourceLanguage::parse("auto").unwrap(), SourceLanguage::Auto);
        assert_eq!(SourceLanguage::parse("Detect").unwrap(), SourceLanguage::Auto);
        assert_eq!(
            SourceLanguage::parse("fr").unwrap(),
            SourceLanguage::Code(code("fr"))
        );
    }

    #[test]
    fn pair_display_and_allowlist() {
        let pair = LanguagePair::parse("es", "en").unwrap();
        assert_eq!(pair.to_string(), "es->en");
        assert!(pair.within(&[code("en"), code("es")]));
        assert!(!pair.within(&[code("en")]));
    }

    #[test]
    fn pair_equality_is_ordered() {
        assert_ne!(
            LanguagePair::parse("es", "en").unwrap(),
            LanguagePair::parse("en", "es").unwrap()
        );
    }

    #[test]
    fn emoji_only_text_is_not_translatable() {
        assert!(!is_translatable("😀 🚀"));
        assert!(!is_translatable("   "));
        assert!(is_translatable("Hola 😀"));
    }

    #[test]
    fn code_serializes_as_string() {
        let json = serde_json::to_string(&code("de")).unwrap();
        assert_eq!(json, "\"de\"");
        let back: LanguageCode = serde_json::from_str("\"zh-TW\"").unwrap();
        assert_eq!(back.as_str(), "zt");
        assert!(serde_json::from_str::<LanguageCode>("\"xx\"").is_err());
    }

    #[test]
    fn parses_code_lists_without_duplicates() {
        let codes = parse_code_list("en, es,,EN,fr").unwrap();
        assert_eq!(codes, vec![code("en"), code("es"), code("fr")]);
        assert!(parse_code_list("en,xx").is_err());
    }
}
