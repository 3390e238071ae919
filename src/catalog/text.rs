use once_cell::sync::Lazy;
use regex::Regex;

static LINE_BREAK_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</p\s*>|</div\s*>|</li\s*>|</h[1-6]\s*>|</tr\s*>")
        .expect("line break tag pattern")
});
static LIST_ITEM_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<li(\s[^>]*)?>").expect("list item pattern"));
static SCRIPT_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)\s*>").expect("script pattern")
});
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag pattern"));
static ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);").expect("entity pattern"));
static INLINE_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").expect("space pattern"));

/// Strips markup from a product description while keeping its line
/// structure. The full text is kept; nothing is truncated.
pub fn clean_description(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let text = SCRIPT_BLOCKS.replace_all(html, " ");
    let text = LINE_BREAK_TAGS.replace_all(&text, "\n");
    let text = LIST_ITEM_TAG.replace_all(&text, "• ");
    let text = ANY_TAG.replace_all(&text, " ");
    let text = decode_entities(&text);

    text.lines()
        .map(|line| INLINE_SPACE.replace_all(line.trim(), " ").into_owned())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(input: &str) -> String {
    ENTITY
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let body = &caps[1];
            let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                named_entity(body)
            };
            decoded
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    let ch = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "ndash" => '–',
        "mdash" => '—',
        "rsquo" => '’',
        "lsquo" => '‘',
        "rdquo" => '”',
        "ldquo" => '“',
        "hellip" => '…',
        "deg" => '°',
        "times" => '×',
        "reg" => '®',
        "trade" => '™',
        "copy" => '©',
        "frac12" => '½',
        "frac14" => '¼',
        "frac34" => '¾',
        "micro" => 'µ',
        "bull" => '•',
        _ => return None,
    };
    Some(ch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keeps_line_structure() {
        let html = "<p>Crystal clear picture.</p><ul><li>3840x2160 resolution</li><li>HDR10+</li></ul>Line one<br/>Line two";
        assert_eq!(
            clean_description(html),
            "Crystal clear picture.\n• 3840x2160 resolution\n• HDR10+\nLine one\nLine two"
        );
    }

    #[test]
    fn decodes_entities() {
        assert_eq!(
            clean_description("Tom &amp; Jerry&nbsp;&#8211; 55&quot; &#x2122; &bogus;"),
            "Tom & Jerry – 55\" ™ &bogus;"
        );
    }

    #[test]
    fn drops_scripts_and_blank_lines() {
        let html = "<div>First</div>\n\n<script>alert('x')</script><div>  Second   part </div>";
        assert_eq!(clean_description(html), "First\nSecond part");
    }

    #[test]
    fn empty_input_is_empty() {
        assert_eq!(clean_description("   "), "");
    }
}
