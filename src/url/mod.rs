use std::sync::LazyLock;

use regex::Regex;

static RE_SCHEME_WWW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[a-z][a-z0-9+.\-]*://)?(?:www\.)?").unwrap());

/// Normalize a URL or bare domain for matching.
///
/// Lowercases, strips the scheme and a leading `www.`, and drops any trailing
/// slash. Paths are kept so that a competitor configured as a sub-path still
/// matches by containment.
///
/// - `https://www.Example.com/` → `example.com`
/// - `http://shop.example.com/blog` → `shop.example.com/blog`
/// - `example.com` → `example.com`
pub fn normalize_url(input: &str) -> String {
    let lowered = input.trim().to_lowercase();
    let stripped = RE_SCHEME_WWW.replace(&lowered, "");
    stripped.trim_end_matches('/').to_string()
}

/// Extract the normalized host of a result URL (`www.` stripped).
/// Returns `None` for anything that is not an absolute http(s) URL.
pub fn domain_of(link: &str) -> Option<String> {
    let parsed = url::Url::parse(link.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// True if `domain` is the tracked site or one of its subdomains.
pub fn is_own_site(domain: &str, site_domain: &str) -> bool {
    let site = normalize_url(site_domain);
    if site.is_empty() {
        return false;
    }
    domain == site || domain.ends_with(&format!(".{site}"))
}

/// Competitor matching: the observed result URL, normalized, contains the
/// competitor's normalized URL.
pub fn matches_competitor(observed_url: &str, competitor_normalized: &str) -> bool {
    !competitor_normalized.is_empty() && normalize_url(observed_url).contains(competitor_normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url_strips_scheme_and_www() {
        assert_eq!(normalize_url("https://www.Example.com/"), "example.com");
        assert_eq!(normalize_url("http://example.com"), "example.com");
        assert_eq!(normalize_url("www.example.com"), "example.com");
        assert_eq!(normalize_url("example.com"), "example.com");
    }

    #[test]
    fn test_normalize_url_keeps_path_and_subdomain() {
        assert_eq!(
            normalize_url("https://shop.example.com/blog/"),
            "shop.example.com/blog"
        );
    }

    #[test]
    fn test_normalize_url_only_strips_leading_www() {
        assert_eq!(normalize_url("https://awww.example.com"), "awww.example.com");
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(
            domain_of("https://www.rival.io/pricing?x=1").as_deref(),
            Some("rival.io")
        );
        assert_eq!(
            domain_of("http://blog.rival.io").as_deref(),
            Some("blog.rival.io")
        );
        assert_eq!(domain_of("not a url"), None);
        assert_eq!(domain_of("ftp://files.rival.io"), None);
    }

    #[test]
    fn test_is_own_site() {
        assert!(is_own_site("example.com", "https://www.example.com"));
        assert!(is_own_site("blog.example.com", "example.com"));
        assert!(!is_own_site("notexample.com", "example.com"));
        assert!(!is_own_site("example.com", ""));
    }

    #[test]
    fn test_matches_competitor_by_containment() {
        assert!(matches_competitor("https://www.rival.io/guide", "rival.io"));
        assert!(matches_competitor("https://shop.rival.io/", "rival.io"));
        assert!(!matches_competitor("https://other.com/rival", "rival.io"));
        assert!(!matches_competitor("https://rival.io", ""));
    }
}
