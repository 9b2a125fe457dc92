/// Number of trailing digits kept in a canonical DID.
pub const CANONICAL_DID_LEN: usize = 10;

/// Reduce a free-form phone number to its canonical form: every non-digit is dropped and
/// the last 10 digits are kept. Shorter inputs come back as whatever digits they had.
///
/// This is a best-effort dedup key, not a validated number: `+1 (555) 123-4567` and
/// `44 555 123 4567` collapse to the same value.
pub fn canonical_did(raw: &str) -> String {
    let digits: Vec<char> = raw.chars().filter(char::is_ascii_digit).collect();
    let skip = digits.len().saturating_sub(CANONICAL_DID_LEN);

    digits[skip..].iter().collect()
}
