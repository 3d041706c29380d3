//! Strips unpaired UTF-16 surrogates and U+FFFD from outbound text.
//!
//! Vendor APIs are intolerant of lone surrogates that can slip into a `String`
//! via lossy decoding upstream; this function makes a string safe to embed in
//! JSON and forward to a vendor.

const HIGH_SURROGATE: std::ops::RangeInclusive<u16> = 0xD800..=0xDBFF;
const LOW_SURROGATE: std::ops::RangeInclusive<u16> = 0xDC00..=0xDFFF;

/// Removes unpaired UTF-16 surrogates and any resulting U+FFFD replacement
/// characters. Pure and idempotent.
pub fn sanitize_surrogates(input: &str) -> String {
    let units: Vec<u16> = input.encode_utf16().collect();
    let mut kept: Vec<u16> = Vec::with_capacity(units.len());

    let mut i = 0;
    while i < units.len() {
        let unit = units[i];
        if HIGH_SURROGATE.contains(&unit) {
            if let Some(&next) = units.get(i + 1) {
                if LOW_SURROGATE.contains(&next) {
                    kept.push(unit);
                    kept.push(next);
                    i += 2;
                    continue;
                }
            }
            // lone high surrogate: drop
            i += 1;
            continue;
        }
        if LOW_SURROGATE.contains(&unit) {
            // lone low surrogate: drop
            i += 1;
            continue;
        }
        kept.push(unit);
        i += 1;
    }

    String::from_utf16_lossy(&kept)
        .chars()
        .filter(|&c| c != '\u{FFFD}')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_well_formed_text() {
        assert_eq!(sanitize_surrogates("hello world"), "hello world");
    }

    #[test]
    fn preserves_valid_surrogate_pair() {
        let emoji = "\u{1F600}"; // grinning face, outside BMP, encodes as a pair
        assert_eq!(sanitize_surrogates(emoji), emoji);
    }

    #[test]
    fn drops_lone_high_surrogate() {
        let units = [0xD800u16, 'x' as u16];
        let s = String::from_utf16_lossy(&units);
        let cleaned = sanitize_surrogates(&s);
        assert_eq!(cleaned, "x");
    }

    #[test]
    fn drops_lone_low_surrogate() {
        let units = ['x' as u16, 0xDC00u16, 'y' as u16];
        let s = String::from_utf16_lossy(&units);
        let cleaned = sanitize_surrogates(&s);
        assert_eq!(cleaned, "xy");
    }

    #[test]
    fn is_idempotent() {
        let s = "mixed \u{1F600} text";
        let once = sanitize_surrogates(s);
        let twice = sanitize_surrogates(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn strips_replacement_character_even_if_well_formed() {
        assert_eq!(sanitize_surrogates("a\u{FFFD}b"), "ab");
    }
}
