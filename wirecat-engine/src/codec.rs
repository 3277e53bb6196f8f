//! Line-ending conversion
//!
//! Pure LF to CRLF conversion with explicit allocate-or-borrow results.
//! Inputs without any LF are returned borrowed, untouched; only inputs that
//! actually need conversion allocate.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use wirecat_utils::{Result, WirecatError};

use crate::relay::Direction;

/// Which relay direction(s) get LF -> CRLF conversion applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrlfMode {
    /// No conversion
    #[default]
    Off,
    /// Convert bytes flowing from the near endpoint to the far endpoint
    NearToFar,
    /// Convert bytes flowing from the far endpoint to the near endpoint
    FarToNear,
    /// Convert both directions
    Both,
}

impl CrlfMode {
    /// Whether conversion applies to the given direction
    pub fn applies_to(self, direction: Direction) -> bool {
        match self {
            CrlfMode::Off => false,
            CrlfMode::NearToFar => direction == Direction::NearToFar,
            CrlfMode::FarToNear => direction == Direction::FarToNear,
            CrlfMode::Both => true,
        }
    }
}

/// Convert LF line endings to CRLF, inserting a CR immediately before every
/// LF.
///
/// Returns `Cow::Borrowed` when the input contains no LF (no allocation),
/// otherwise `Cow::Owned` with length `input.len() + lf_count`.
///
/// Pre-existing CRLF sequences are not special-cased: converting `"a\r\n"`
/// yields `"a\r\r\n"`. Matching netcat lineage, this is documented behavior,
/// not a bug to fix here.
pub fn convert(input: &[u8]) -> Result<Cow<'_, [u8]>> {
    let lf_count = input.iter().filter(|&&b| b == b'\n').count();
    if lf_count == 0 {
        return Ok(Cow::Borrowed(input));
    }

    let mut out: Vec<u8> = Vec::new();
    out.try_reserve_exact(input.len() + lf_count)
        .map_err(|e| WirecatError::out_of_memory(e.to_string()))?;

    for &b in input {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }

    Ok(Cow::Owned(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Borrow/Own Tests ====================

    #[test]
    fn test_no_lf_borrows() {
        let input = b"no line feed here";
        let result = convert(input).unwrap();
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(&*result, input);
    }

    #[test]
    fn test_no_lf_borrow_is_same_slice() {
        let input = b"abc";
        let result = convert(input).unwrap();
        match result {
            Cow::Borrowed(slice) => assert!(std::ptr::eq(slice, input.as_slice())),
            Cow::Owned(_) => panic!("expected borrowed result"),
        }
    }

    #[test]
    fn test_empty_input_borrows() {
        let result = convert(b"").unwrap();
        assert!(matches!(result, Cow::Borrowed(_)));
        assert!(result.is_empty());
    }

    #[test]
    fn test_lf_allocates() {
        let result = convert(b"a\n").unwrap();
        assert!(matches!(result, Cow::Owned(_)));
        assert_eq!(&*result, b"a\r\n");
    }

    // ==================== Conversion Tests ====================

    #[test]
    fn test_length_grows_by_lf_count() {
        let input = b"one\ntwo\nthree\n";
        let lf_count = input.iter().filter(|&&b| b == b'\n').count();
        let result = convert(input).unwrap();
        assert_eq!(result.len(), input.len() + lf_count);
    }

    #[test]
    fn test_cr_precedes_every_lf() {
        let result = convert(b"a\nb\nc\n").unwrap();
        let bytes = &*result;
        for (i, &b) in bytes.iter().enumerate() {
            if b == b'\n' {
                assert_eq!(bytes[i - 1], b'\r', "LF at {} not preceded by CR", i);
            }
        }
    }

    #[test]
    fn test_original_bytes_preserved_in_order() {
        let input = b"hello\nworld\n";
        let result = convert(input).unwrap();
        let stripped: Vec<u8> = {
            // Remove exactly one CR before each LF to recover the input
            let mut out = Vec::new();
            let bytes = &*result;
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] == b'\r' && i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
                    i += 1;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            out
        };
        assert_eq!(stripped, input);
    }

    #[test]
    fn test_lf_only_input() {
        let result = convert(b"\n").unwrap();
        assert_eq!(&*result, b"\r\n");
    }

    #[test]
    fn test_consecutive_lfs() {
        let result = convert(b"\n\n\n").unwrap();
        assert_eq!(&*result, b"\r\n\r\n\r\n");
    }

    #[test]
    fn test_existing_crlf_gets_extra_cr() {
        // Documented quirk: pre-existing CRLF is not detected
        let result = convert(b"a\r\n").unwrap();
        assert_eq!(&*result, b"a\r\r\n");
    }

    #[test]
    fn test_not_idempotent() {
        let once = convert(b"x\n").unwrap().into_owned();
        let twice = convert(&once).unwrap().into_owned();
        assert_eq!(once, b"x\r\n");
        assert_eq!(twice, b"x\r\r\n");
    }

    #[test]
    fn test_binary_bytes_untouched() {
        let input: Vec<u8> = (0u8..=255).filter(|&b| b != b'\n').collect();
        let result = convert(&input).unwrap();
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(&*result, input.as_slice());
    }

    // ==================== CrlfMode Tests ====================

    #[test]
    fn test_crlf_mode_default_off() {
        assert_eq!(CrlfMode::default(), CrlfMode::Off);
    }

    #[test]
    fn test_crlf_mode_applies_to() {
        assert!(!CrlfMode::Off.applies_to(Direction::NearToFar));
        assert!(!CrlfMode::Off.applies_to(Direction::FarToNear));

        assert!(CrlfMode::NearToFar.applies_to(Direction::NearToFar));
        assert!(!CrlfMode::NearToFar.applies_to(Direction::FarToNear));

        assert!(!CrlfMode::FarToNear.applies_to(Direction::NearToFar));
        assert!(CrlfMode::FarToNear.applies_to(Direction::FarToNear));

        assert!(CrlfMode::Both.applies_to(Direction::NearToFar));
        assert!(CrlfMode::Both.applies_to(Direction::FarToNear));
    }

    #[test]
    fn test_crlf_mode_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: CrlfMode,
        }
        let w: Wrapper = toml::from_str(r#"mode = "near_to_far""#).unwrap();
        assert_eq!(w.mode, CrlfMode::NearToFar);
    }
}
