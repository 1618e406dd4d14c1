use bytes::{Buf, BytesMut};
use protocol::framing::{TOKEN_CLOSE, TOKEN_OPEN};
use regex::Regex;
use std::sync::LazyLock;

static WEIGHT_TOKEN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^\((\d+)\)$"));
static TEMPERATURE_TOKEN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^\(?\s*T([+-])(\d{2})\s*\)?$"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode<'a> {
    /// Token equal to the expected one once brackets and whitespace are stripped.
    Exact(&'a str),
    /// First `(digits)` token, read as grams.
    Weight,
    /// First `T+NN` / `T-NN` token, read as degrees Celsius.
    Temperature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matched {
    Token(String),
    Weight { token: String, grams: u32 },
    Temperature { token: String, celsius: i32 },
}

impl Matched {
    pub fn token(&self) -> &str {
        match self {
            Matched::Token(token)
            | Matched::Weight { token, .. }
            | Matched::Temperature { token, .. } => token,
        }
    }
}

/// Accumulates raw bytes and peels off `(...)` tokens in arrival order.
#[derive(Debug, Default)]
pub struct TokenBuffer {
    pending: BytesMut,
    tokens: Vec<String>,
    received_any: bool,
}

impl TokenBuffer {
    /// Appends a chunk and returns how many new tokens it completed.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        if chunk.is_empty() {
            return 0;
        }
        self.received_any = true;
        self.pending.extend_from_slice(chunk);
        let before = self.tokens.len();
        while let Some(start) = self.pending.iter().position(|byte| *byte == TOKEN_OPEN) {
            let Some(offset) = self.pending[start..].iter().position(|byte| *byte == TOKEN_CLOSE) else {
                break;
            };
            let end = start + offset;
            let token = String::from_utf8_lossy(&self.pending[start..=end]).trim().to_string();
            self.pending.advance(end + 1);
            if !token.is_empty() {
                self.tokens.push(token);
            }
        }
        self.tokens.len() - before
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn received_any(&self) -> bool {
        self.received_any
    }

    pub fn find(&self, mode: MatchMode<'_>) -> Option<Matched> {
        self.tokens.iter().find_map(|token| classify(token, mode))
    }

    /// Text describing what arrived, for error messages when nothing matched.
    pub fn diagnostic(&self) -> String {
        if !self.tokens.is_empty() {
            return self.tokens.join(", ");
        }
        if self.received_any {
            let remainder = String::from_utf8_lossy(&self.pending).trim().to_string();
            if remainder.is_empty() {
                return "(no bracketed token)".to_string();
            }
            return remainder;
        }
        "(no response)".to_string()
    }
}

pub fn classify(token: &str, mode: MatchMode<'_>) -> Option<Matched> {
    match mode {
        MatchMode::Exact(expected) => (normalize_token(token) == normalize_token(expected))
            .then(|| Matched::Token(token.to_string())),
        MatchMode::Weight => parse_weight(token).map(|grams| Matched::Weight {
            token: token.to_string(),
            grams,
        }),
        MatchMode::Temperature => parse_temperature(token).map(|celsius| Matched::Temperature {
            token: token.to_string(),
            celsius,
        }),
    }
}

/// Strips surrounding whitespace and one pair of optional brackets.
pub fn normalize_token(token: &str) -> &str {
    let token = token.trim();
    let token = token.strip_prefix('(').unwrap_or(token);
    let token = token.strip_suffix(')').unwrap_or(token);
    token.trim()
}

pub fn parse_weight(token: &str) -> Option<u32> {
    let captures = WEIGHT_TOKEN.as_ref().ok()?.captures(token.trim())?;
    captures.get(1)?.as_str().parse().ok()
}

pub fn parse_temperature(token: &str) -> Option<i32> {
    let captures = TEMPERATURE_TOKEN.as_ref().ok()?.captures(token.trim())?;
    let value: i32 = captures.get(2)?.as_str().parse().ok()?;
    match captures.get(1)?.as_str() {
        "-" => Some(-value),
        _ => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_patterns_compile() {
        assert!(WEIGHT_TOKEN.is_ok());
        assert!(TEMPERATURE_TOKEN.is_ok());
    }

    #[test]
    fn extracts_tokens_across_chunks() {
        let mut buffer = TokenBuffer::default();
        assert_eq!(buffer.push(b"noise(IS"), 0);
        assert_eq!(buffer.push(b"NN)\r\n(WT"), 1);
        assert_eq!(buffer.push(b"OK)"), 1);
        assert_eq!(buffer.tokens(), ["(ISNN)", "(WTOK)"]);
    }

    #[test]
    fn exact_mode_ignores_brackets_and_whitespace() {
        let mut buffer = TokenBuffer::default();
        buffer.push(b"( ISNN )");
        assert_eq!(
            buffer.find(MatchMode::Exact("ISNN")),
            Some(Matched::Token("( ISNN )".to_string()))
        );
        assert_eq!(buffer.find(MatchMode::Exact("(isnn)")), None);
    }

    #[test]
    fn exact_mode_picks_expected_among_alternatives() {
        let mut buffer = TokenBuffer::default();
        buffer.push(b"(ISNN) / (ISNF)");
        assert!(buffer.find(MatchMode::Exact("(ISNF)")).is_some());
        assert!(buffer.find(MatchMode::Exact("(DSON)")).is_none());
    }

    #[test]
    fn weight_mode_takes_first_numeric_token() {
        let mut buffer = TokenBuffer::default();
        buffer.push(b"(WTOK)(15000)(200)");
        assert_eq!(
            buffer.find(MatchMode::Weight),
            Some(Matched::Weight {
                token: "(15000)".to_string(),
                grams: 15000
            })
        );
    }

    #[test]
    fn weight_mode_rejects_signed_or_mixed_tokens() {
        assert_eq!(parse_weight("(-5)"), None);
        assert_eq!(parse_weight("(12a)"), None);
        assert_eq!(parse_weight("(99999999999)"), None);
        assert_eq!(parse_weight("(0)"), Some(0));
    }

    #[test]
    fn temperature_parses_sign() {
        assert_eq!(parse_temperature("(T+04)"), Some(4));
        assert_eq!(parse_temperature("(T-12)"), Some(-12));
        assert_eq!(parse_temperature("T+07"), Some(7));
        assert_eq!(parse_temperature("(T+4)"), None);
        assert_eq!(parse_temperature("(TEMP)"), None);
    }

    #[test]
    fn diagnostic_reports_what_arrived() {
        let mut buffer = TokenBuffer::default();
        assert_eq!(buffer.diagnostic(), "(no response)");
        buffer.push(b"garbage");
        assert_eq!(buffer.diagnostic(), "garbage");
        buffer.push(b"(DSOF)(DSON)");
        assert_eq!(buffer.diagnostic(), "(DSOF), (DSON)");
    }
}
