//! URL canonicalization and HTML-to-text normalization.
//!
//! `content_hash` is computed over the whitespace-collapsed, lowercased,
//! tag-stripped page text, so change detection ignores markup reshuffling.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script>").unwrap());
static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style>").unwrap());
static NOSCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<noscript\b[^>]*>.*?</noscript>").unwrap());
static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Canonicalize a URL-ish string. Accepts bare hostnames and full URLs;
/// anything that is not http/https comes back as `None`.
pub fn normalize_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = Url::parse(&with_scheme).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() {
        return None;
    }

    let mut path = String::with_capacity(parsed.path().len());
    for c in parsed.path().chars() {
        if c == '/' && path.ends_with('/') {
            continue;
        }
        path.push(c);
    }
    if path.is_empty() {
        path.push('/');
    }

    let mut out = format!("{}://{host}", parsed.scheme());
    if let Some(port) = parsed.port() {
        out.push_str(&format!(":{port}"));
    }
    out.push_str(&path);
    Some(out)
}

/// Canonical domain form of a URL-ish string: the normalized host.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let normalized = normalize_url(raw)?;
    let parsed = Url::parse(&normalized).ok()?;
    parsed.host_str().map(str::to_string)
}

/// True iff the URL's normalized host equals `domain` or is a subdomain of it.
pub fn matches_domain(url: &str, domain: &str) -> bool {
    let Some(normalized) = normalize_url(url) else {
        return false;
    };
    let Ok(parsed) = Url::parse(&normalized) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let domain = domain.trim().to_ascii_lowercase();
    let domain = domain.strip_prefix("www.").unwrap_or(&domain);
    if domain.is_empty() {
        return false;
    }
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Strip markup down to visible text: script/style/noscript blocks and
/// comments first, then all tags, then the basic entities, then whitespace
/// collapse.
pub fn strip_html_to_text(html: &str) -> String {
    let text = SCRIPT_RE.replace_all(html, " ");
    let text = STYLE_RE.replace_all(&text, " ");
    let text = NOSCRIPT_RE.replace_all(&text, " ");
    let text = COMMENT_RE.replace_all(&text, " ");
    let text = TAG_RE.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}

/// The hash input form: lowercased stripped text.
pub fn normalize_html_for_hash(html: &str) -> String {
    strip_html_to_text(html).to_lowercase()
}

/// Lowercase hexadecimal SHA-256.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_hostname_gets_https_scheme() {
        assert_eq!(
            normalize_url("acme.example").as_deref(),
            Some("https://acme.example/")
        );
    }

    #[test]
    fn strips_www_query_and_fragment() {
        assert_eq!(
            normalize_url("https://www.Acme.Example/Pricing?utm=x#plans").as_deref(),
            Some("https://acme.example/Pricing")
        );
    }

    #[test]
    fn collapses_duplicate_slashes() {
        assert_eq!(
            normalize_url("https://acme.example//a///b").as_deref(),
            Some("https://acme.example/a/b")
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert_eq!(normalize_url("ftp://acme.example/x"), None);
        assert_eq!(normalize_url("javascript:void(0)"), None);
        assert_eq!(normalize_url(""), None);
    }

    #[test]
    fn normalize_url_is_idempotent() {
        for raw in [
            "acme.example",
            "https://www.acme.example//pricing?x=1#top",
            "http://sub.acme.example:8080/a//b/",
        ] {
            let once = normalize_url(raw).unwrap();
            assert_eq!(normalize_url(&once).as_deref(), Some(once.as_str()));
        }
    }

    #[test]
    fn domain_is_the_normalized_host() {
        assert_eq!(
            normalize_domain("www.Acme.Example").as_deref(),
            Some("acme.example")
        );
        assert_eq!(
            normalize_domain("https://app.acme.example/pricing").as_deref(),
            Some("app.acme.example")
        );
        assert_eq!(normalize_domain("javascript:void(0)"), None);
    }

    #[test]
    fn domain_matching_allows_subdomains_only() {
        assert!(matches_domain("https://acme.example/pricing", "acme.example"));
        assert!(matches_domain("https://app.acme.example/", "acme.example"));
        assert!(matches_domain("https://www.acme.example/", "acme.example"));
        assert!(!matches_domain("https://acme.example.evil.com/", "acme.example"));
        assert!(!matches_domain("https://notacme.example/", "acme.example"));
    }

    #[test]
    fn strips_scripts_styles_comments_and_entities() {
        let html = r#"<html><head><style>p{color:red}</style>
            <script>var x = "<b>hidden</b>";</script></head>
            <body><!-- nope --><p>Starter&nbsp;&amp;&quot;Pro&quot;&#39;s   plans</p>
            <noscript>enable js</noscript></body></html>"#;
        assert_eq!(
            strip_html_to_text(html),
            r#"Starter &"Pro"'s plans"#
        );
    }

    #[test]
    fn content_hash_ignores_markup_and_case_churn() {
        let a = "<div><p>Pro $49 per month</p></div>";
        let b = "<section>\n  <span>PRO</span>   $49 PER <b>MONTH</b>\n</section>";
        assert_eq!(
            content_hash(&normalize_html_for_hash(a)),
            content_hash(&normalize_html_for_hash(b))
        );
    }

    #[test]
    fn content_hash_is_lowercase_hex_sha256() {
        assert_eq!(
            content_hash("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
