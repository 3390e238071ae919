use once_cell::sync::Lazy;
use regex::Regex;

static CANONICAL_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("canonical key pattern"));

/// Returns true when `key` is already a lowercase, hyphenated slug.
pub fn is_canonical_key(key: &str) -> bool {
    CANONICAL_KEY.is_match(key)
}

/// Derives a canonical key from a display name or a loosely formatted key.
///
/// Runs of anything outside `[a-z0-9]` collapse into a single hyphen and `+`
/// is spelled out (`HDR10+` becomes `hdr10plus`). Names with no ASCII
/// alphanumerics at all get a stable hashed key so the result is always a
/// valid slug. Applying it to its own output is a no-op.
pub fn slugify(raw: &str) -> String {
    let trimmed = raw.trim();
    let lowered = trimmed.to_lowercase().replace('+', "plus");
    let mut slug = String::with_capacity(lowered.len());
    let mut pending_dash = false;
    for ch in lowered.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() && !trimmed.is_empty() {
        return format!("attr-{:08x}", stable_hash(trimmed) as u32);
    }
    slug
}

/// FNV-1a, stable across builds and platforms.
pub fn stable_hash(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_display_names() {
        assert_eq!(slugify("Display resolution"), "display-resolution");
        assert_eq!(slugify("  Screen Size (in) "), "screen-size-in");
        assert_eq!(slugify("power_source"), "power-source");
        assert_eq!(slugify("HDR10+"), "hdr10plus");
        assert_eq!(slugify("Color"), "color");
    }

    #[test]
    fn slugify_is_idempotent() {
        for raw in ["Display resolution", "a--b__c", "HDR10+", "حجم المروحة", "  ", "X/Y"] {
            let once = slugify(raw);
            assert_eq!(slugify(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn non_ascii_names_still_produce_valid_keys() {
        let key = slugify("حجم المروحة");
        assert!(is_canonical_key(&key), "{key}");
        assert_eq!(key, slugify("حجم المروحة"));
        assert_ne!(key, slugify("عدد الشفرات"));
    }

    #[test]
    fn canonical_key_pattern() {
        assert!(is_canonical_key("display-resolution"));
        assert!(is_canonical_key("4k"));
        assert!(!is_canonical_key("Display-resolution"));
        assert!(!is_canonical_key("screen--size"));
        assert!(!is_canonical_key("-screen"));
        assert!(!is_canonical_key("power_source"));
        assert!(!is_canonical_key(""));
    }
}
