//! Repair of Cyrillic text that was stored with the wrong encoding.
//!
//! Older records were sometimes written after a UTF-8 payload had been read
//! as Latin-1/Windows-1252 (`"Ð˜Ð²Ð°Ð½"`), or after Windows-1251 bytes had
//! been read as Latin-1 (`"Èâàí"`). [`repair_text`] tries a fixed chain of
//! reinterpretations and keeps the input whenever none of them applies.

use encoding_rs::{WINDOWS_1251, WINDOWS_1252};
use std::borrow::Cow;

/// Attempts, in order:
/// 1. leave text that already contains Cyrillic, or that looks clean, alone;
/// 2. re-encode as Latin-1/Windows-1252 bytes and decode as UTF-8;
/// 3. re-encode as Latin-1 bytes and decode as Windows-1251.
///
/// When every step fails the original text is returned unchanged.
pub fn repair_text(text: &str) -> Cow<'_, str> {
    if text.is_empty() || has_cyrillic(text) {
        return Cow::Borrowed(text);
    }

    let utf8_suspect = text.contains(['Ð', 'Ñ']);
    let cp1251_suspect = looks_like_cp1251(text);
    if !utf8_suspect && !cp1251_suspect {
        return Cow::Borrowed(text);
    }

    if utf8_suspect {
        if let Some(fixed) = legacy_bytes(text).and_then(|b| String::from_utf8(b).ok()) {
            return Cow::Owned(fixed);
        }
    }

    if cp1251_suspect {
        if let Some(bytes) = legacy_bytes(text) {
            let (decoded, had_errors) = WINDOWS_1251.decode_without_bom_handling(&bytes);
            if !had_errors && has_cyrillic(&decoded) {
                return Cow::Owned(decoded.into_owned());
            }
        }
    }

    tracing::debug!(text, "Encoding repair exhausted all strategies, keeping original");
    Cow::Borrowed(text)
}

fn has_cyrillic(text: &str) -> bool {
    text.chars().any(|c| matches!(c, 'А'..='я' | 'Ё' | 'ё'))
}

/// Letters only from the Latin-1 range that Windows-1251 maps to Cyrillic;
/// any ASCII letter means the text is genuine Latin script.
fn looks_like_cp1251(text: &str) -> bool {
    let mut high = false;
    for c in text.chars() {
        match c as u32 {
            0xC0..=0xFF | 0xA8 | 0xB8 => high = true,
            _ if c.is_ascii_alphabetic() => return false,
            _ if c.is_ascii() => {}
            _ => return false,
        }
    }
    high
}

/// One byte per char: Latin-1 directly, otherwise the Windows-1252 code.
fn legacy_bytes(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut buf = [0u8; 4];
    for c in text.chars() {
        if let Ok(b) = u8::try_from(u32::from(c)) {
            out.push(b);
            continue;
        }
        let (bytes, _, had_errors) = WINDOWS_1252.encode(c.encode_utf8(&mut buf));
        if had_errors || bytes.len() != 1 {
            return None;
        }
        out.push(bytes[0]);
    }
    Some(out)
}
