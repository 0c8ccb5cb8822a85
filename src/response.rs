//! Parsing of raw adapter responses into byte vectors.
//!
//! The adapter echoes everything as ASCII hex with optional spaces, line
//! breaks between ECU lines, and a final `>` prompt. Sensors, the
//! capability map, and the DTC reader all go through [`parse_bytes`].

use crate::error::DecodeError;

/// Strip spaces, tabs, CR and LF, leaving hex characters and the prompt.
pub(crate) fn clean(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_ascii_whitespace()).collect()
}

/// Remove line breaks and the trailing prompt for free-text responses
/// such as `ATRV` or `ATDP`, keeping inner spacing.
pub(crate) fn clean_text(raw: &str) -> String {
    let text: String = raw.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    text.strip_suffix('>').unwrap_or(&text).trim().to_owned()
}

/// Parse a raw response into its integer bytes.
///
/// Special adapter replies are mapped to errors before any hex parsing:
/// `NO DATA` and `?` become [`DecodeError::NoData`], `BUS ERROR` becomes
/// [`DecodeError::BusError`]. The prompt must be the last character and is
/// stripped; what remains must be an even number of hex characters.
pub(crate) fn parse_bytes(raw: &str) -> Result<Vec<u8>, DecodeError> {
    let cleaned = clean(raw);

    if cleaned == "NODATA>" || cleaned == "?>" {
        return Err(DecodeError::NoData);
    }
    if cleaned == "BUSERROR>" {
        return Err(DecodeError::BusError);
    }

    let payload = cleaned.strip_suffix('>').ok_or(DecodeError::NoPrompt)?;
    if payload.len() % 2 != 0 {
        return Err(DecodeError::OddNibbles);
    }

    payload
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or(DecodeError::NonHex)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_spaced_hex() {
        assert_eq!(
            parse_bytes("41 0C 1A F8 \r\r>").unwrap(),
            vec![0x41, 0x0C, 0x1A, 0xF8]
        );
    }

    #[test]
    fn parses_compact_hex() {
        assert_eq!(parse_bytes("410D50>").unwrap(), vec![0x41, 0x0D, 0x50]);
    }

    #[test]
    fn missing_prompt_is_rejected() {
        assert!(matches!(
            parse_bytes("41 0C 1A F8\r"),
            Err(DecodeError::NoPrompt)
        ));
    }

    #[test]
    fn odd_nibble_count_is_rejected() {
        assert!(matches!(
            parse_bytes("41 0C 1\r>"),
            Err(DecodeError::OddNibbles)
        ));
    }

    #[test]
    fn non_hex_is_rejected() {
        assert!(matches!(
            parse_bytes("41 0C ZZ FF\r>"),
            Err(DecodeError::NonHex)
        ));
    }

    #[test]
    fn special_responses_are_detected() {
        assert!(matches!(
            parse_bytes("NO DATA\r\r>"),
            Err(DecodeError::NoData)
        ));
        assert!(matches!(parse_bytes("?\r>"), Err(DecodeError::NoData)));
        assert!(matches!(
            parse_bytes("BUS ERROR\r>"),
            Err(DecodeError::BusError)
        ));
    }

    #[test]
    fn text_cleanup_keeps_inner_spacing() {
        assert_eq!(clean_text("ISO 9141-2\r\r>"), "ISO 9141-2");
        assert_eq!(clean_text("12.6V\r>"), "12.6V");
    }
}
