//! Locator (MRL) resolution and fragment-number substitution.
//!
//! Resolution is deliberately lighter than RFC 3986: references are joined
//! at the last path separator of the base and `.`/`..` segments are kept
//! verbatim, matching what servers that hand out such playlists expect.

use std::ops::Range;

use url::Url;

/// Resolve `reference` against the manifest location `base`.
///
/// A reference carrying a scheme delimiter replaces the base entirely.
/// Protocol-relative (`//host/..`) and host-absolute (`/path`) references
/// keep the scheme/authority of the base. Anything else is appended after the
/// last `/` of the base path (query and fragment of the base are dropped).
pub fn resolve(base: &str, reference: &str) -> String {
    let reference = reference.trim();
    if reference.contains("://") {
        return reference.to_string();
    }

    if let Some(rest) = reference.strip_prefix("//") {
        return match base.find("://") {
            Some(idx) => format!("{}://{rest}", &base[..idx]),
            None => reference.to_string(),
        };
    }

    if reference.starts_with('/') {
        return match Url::parse(base) {
            Ok(url) if url.has_host() => {
                let mut origin = url.origin().ascii_serialization();
                origin.push_str(reference);
                origin
            }
            _ => reference.to_string(),
        };
    }

    let path_end = base.find(['?', '#']).unwrap_or(base.len());
    let path = &base[..path_end];
    let authority_end = path.find("://").map(|idx| idx + 3).unwrap_or(0);
    match path[authority_end..].rfind('/') {
        Some(slash) => format!("{}{reference}", &path[..authority_end + slash + 1]),
        None if authority_end > 0 => format!("{path}/{reference}"),
        None => reference.to_string(),
    }
}

/// A locator with one decimal token that can be re-bound in place.
///
/// Used both for `$Number$` templates and for the digit run discovered by
/// the bump strategy. Rebinding only rewrites the token and shifts the
/// suffix, so the rest of the string is never re-rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberSlot {
    text: String,
    token: Range<usize>,
    width: usize,
    value: u64,
}

impl NumberSlot {
    /// Wrap `text` whose byte range `token` currently renders `value` with at
    /// least `width` digits.
    pub fn new(text: String, token: Range<usize>, width: usize, value: u64) -> Self {
        Self {
            text,
            token,
            width,
            value,
        }
    }

    /// Build a slot from a template containing `$<name>$` or
    /// `$<name>%0<w>d$`. The placeholder is replaced by `initial`.
    pub fn from_template(template: &str, name: &str, initial: u64) -> Option<Self> {
        let (span, width) = find_placeholder(template, name)?;
        let prefix = unescape_dollars(&template[..span.start]);
        let suffix = unescape_dollars(&template[span.end..]);
        let rendered = render(initial, width);

        let mut text = String::with_capacity(prefix.len() + rendered.len() + suffix.len());
        text.push_str(&prefix);
        let start = text.len();
        text.push_str(&rendered);
        let end = text.len();
        text.push_str(&suffix);

        Some(Self::new(text, start..end, width, initial))
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn token(&self) -> Range<usize> {
        self.token.clone()
    }

    /// Substitute `n` for the token, padding with zeros to the slot width.
    pub fn bind(&mut self, n: u64) -> &str {
        if n != self.value {
            let rendered = render(n, self.width);
            self.text.replace_range(self.token.clone(), &rendered);
            self.token.end = self.token.start + rendered.len();
            self.value = n;
        }
        &self.text
    }

    /// Advance the token by one (`"099"` becomes `"100"`).
    pub fn bump(&mut self) -> Option<&str> {
        let next = self.value.checked_add(1)?;
        Some(self.bind(next))
    }
}

/// Replace identifier placeholders (`$RepresentationID$`, `$Bandwidth$`, ...)
/// that do not change from one fragment to the next.
pub fn substitute(template: &str, name: &str, value: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some((span, width)) = find_placeholder(rest, name) {
        out.push_str(&rest[..span.start]);
        match value.parse::<u64>() {
            Ok(number) if width > 0 => out.push_str(&render(number, width)),
            _ => out.push_str(value),
        }
        rest = &rest[span.end..];
    }
    out.push_str(rest);
    out
}

/// Whether `template` still contains a `$<name>...$` placeholder.
pub fn has_placeholder(template: &str, name: &str) -> bool {
    find_placeholder(template, name).is_some()
}

/// Finish a template by resolving `$$` escapes.
pub fn unescape_dollars(template: &str) -> String {
    template.replace("$$", "$")
}

fn render(n: u64, width: usize) -> String {
    format!("{n:0width$}")
}

/// Locate `$name$` / `$name%0Nd$`, returning its byte span and pad width.
fn find_placeholder(template: &str, name: &str) -> Option<(Range<usize>, usize)> {
    let bytes = template.as_bytes();
    let mut search = 0;
    while let Some(rel) = template[search..].find('$') {
        let start = search + rel;
        // `$$` is an escaped dollar sign
        if bytes.get(start + 1) == Some(&b'$') {
            search = start + 2;
            continue;
        }
        let Some(close_rel) = template[start + 1..].find('$') else {
            return None;
        };
        let end = start + 1 + close_rel;
        let body = &template[start + 1..end];
        if body == name {
            return Some((start..end + 1, 0));
        }
        if let Some(format) = body.strip_prefix(name).and_then(|f| f.strip_prefix('%')) {
            let digits = format.strip_suffix('d').unwrap_or(format);
            let width = digits.trim_start_matches('0').parse::<usize>().unwrap_or(1);
            return Some((start..end + 1, width));
        }
        search = end + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("http://cdn/a/b/index.m3u8", "seg1.ts", "http://cdn/a/b/seg1.ts")]
    #[case("http://cdn/a/index.m3u8?token=1", "seg1.ts", "http://cdn/a/seg1.ts")]
    #[case("http://cdn/a/index.m3u8", "../x/seg.ts", "http://cdn/a/../x/seg.ts")]
    #[case("http://cdn/a/index.m3u8", "https://other/seg.ts", "https://other/seg.ts")]
    #[case("https://cdn/a/index.m3u8", "//edge/seg.ts", "https://edge/seg.ts")]
    #[case("http://cdn:8080/a/index.m3u8", "/root/seg.ts", "http://cdn:8080/root/seg.ts")]
    #[case("http://cdn", "seg.ts", "http://cdn/seg.ts")]
    #[case("/srv/media/index.m3u8", "seg.ts", "/srv/media/seg.ts")]
    #[case("index.m3u8", "seg.ts", "seg.ts")]
    fn resolves_references(#[case] base: &str, #[case] reference: &str, #[case] expected: &str) {
        assert_eq!(resolve(base, reference), expected);
    }

    #[test]
    fn binds_number_template_with_width() {
        let mut slot = NumberSlot::from_template("v/seg-$Number%05d$.m4s", "Number", 1).unwrap();
        assert_eq!(slot.as_str(), "v/seg-00001.m4s");
        assert_eq!(slot.bind(123), "v/seg-00123.m4s");
        assert_eq!(slot.bind(1234567), "v/seg-1234567.m4s");
        assert_eq!(slot.bind(7), "v/seg-00007.m4s");
    }

    #[test]
    fn bump_carries_into_longer_token() {
        let mut slot = NumberSlot::new("clip_099.ts".to_string(), 5..8, 3, 99);
        assert_eq!(slot.bump(), Some("clip_100.ts"));
        assert_eq!(slot.bump(), Some("clip_101.ts"));
        assert_eq!(slot.token(), 5..8);
    }

    #[test]
    fn substitute_keeps_escapes_for_later() {
        let out = substitute("$RepresentationID$/$$x-$Bandwidth%08d$", "RepresentationID", "v1");
        let out = substitute(&out, "Bandwidth", "500000");
        assert_eq!(out, "v1/$$x-00500000");
        assert_eq!(unescape_dollars(&out), "v1/$x-00500000");
        assert!(!has_placeholder(&out, "Number"));
    }

    #[test]
    fn escaped_dollar_is_not_a_placeholder() {
        let slot = NumberSlot::from_template("a$$Number$$b/$Number$.ts", "Number", 4).unwrap();
        assert_eq!(slot.as_str(), "a$Number$b/4.ts");
    }
}
