use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static REPEATED_SLASHES: Lazy<Regex> = Lazy::new(|| Regex::new(r"/{2,}").expect("valid slash regex"));

/// Canonical form of a URL for duplicate detection only; never shown to users.
///
/// Lowercases scheme and host, drops default ports and fragments, collapses
/// repeated path slashes, strips a trailing slash (except on the root path)
/// and sorts query pairs by key. Input that does not parse as an absolute URL
/// falls back to its trimmed, lowercased text.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_lowercase();
    };

    url.set_fragment(None);

    if !url.cannot_be_a_base() {
        let collapsed = REPEATED_SLASHES.replace_all(url.path(), "/").to_string();
        let path = if collapsed.len() > 1 {
            collapsed.trim_end_matches('/').to_string()
        } else {
            collapsed
        };
        let path = if path.is_empty() { "/".to_string() } else { path };
        url.set_path(&path);
    }

    let mut pairs = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    url.to_string()
}

pub fn same_url(a: &str, b: &str) -> bool {
    normalize_url(a) == normalize_url(b)
}

#[cfg(test)]
mod tests {
    use super::{normalize_url, same_url};

    #[test]
    fn canonicalizes_host_port_fragment_path_and_query() {
        let left = normalize_url("HTTPS://Example.com:443//a///b/?y=2&x=1#frag");
        let right = normalize_url("http://example.com/a/b?x=1&y=2");
        assert_eq!(left, "https://example.com/a/b?x=1&y=2");
        assert_eq!(right, "http://example.com/a/b?x=1&y=2");
        assert_ne!(left, right);
    }

    #[test]
    fn keeps_non_default_ports_and_root_path() {
        assert_eq!(normalize_url("http://Example.com:8080"), "http://example.com:8080/");
        assert_eq!(normalize_url("http://example.com:80/"), "http://example.com/");
    }

    #[test]
    fn empty_query_is_dropped() {
        assert_eq!(normalize_url("https://example.com/path/?#top"), "https://example.com/path");
    }

    #[test]
    fn unparseable_input_falls_back_to_lowercase_text() {
        assert_eq!(normalize_url("  Not A Url "), "not a url");
        assert!(same_url("https://example.com/a#x", "https://EXAMPLE.com/a/"));
    }
}
