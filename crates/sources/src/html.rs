//! Markup stripping for feed titles and bodies.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_SCRIPT_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>")
        .expect("valid script/style regex")
});
static RE_TAGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->|</?[A-Za-z!][^>]*>").expect("valid tag regex"));
static RE_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("valid newline regex"));
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").expect("valid space regex"));

/// Reduce an HTML fragment to its text content.
///
/// Drops `script`/`style` blocks and comments, removes tags, decodes entities,
/// squeezes runs of blank lines and spaces, and trims.
pub fn strip_html(input: &str) -> String {
    let out = RE_SCRIPT_STYLE.replace_all(input, "");
    let out = RE_TAGS.replace_all(&out, "");
    let out = html_escape::decode_html_entities(&out);
    let out = RE_BLANK_LINES.replace_all(&out, "\n\n");
    let out = RE_SPACES.replace_all(&out, " ");
    out.trim().to_string()
}

/// Replace HTML-only named entities that are not valid in XML.
///
/// Many feeds embed `&nbsp;` and friends outside CDATA, which an XML parser
/// rejects.
pub(crate) fn scrub_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", "&#160;")
        .replace("&ndash;", "&#8211;")
        .replace("&mdash;", "&#8212;")
        .replace("&ldquo;", "&#8220;")
        .replace("&rdquo;", "&#8221;")
        .replace("&lsquo;", "&#8216;")
        .replace("&rsquo;", "&#8217;")
        .replace("&hellip;", "&#8230;")
}
