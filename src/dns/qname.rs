// QNAME framing for upstream payloads
//
// payload -> base32 (RFC 4648, uppercase, unpadded) -> dotted every 57 chars
// counted from the right -> "<dotted>.<domain>."
//
// Decoding strips every dot and accepts either case. When several tunnel
// domains are configured the longest matching suffix wins.

use super::{DnsError, Rcode, Result, DOT_INTERVAL, MAX_DNS_NAME_LEN};
use data_encoding::BASE32_NOPAD;

/// Base32 encode without padding
pub fn base32_encode(payload: &[u8]) -> String {
    BASE32_NOPAD.encode(payload)
}

/// Base32 decode, case-insensitive
pub fn base32_decode(encoded: &str) -> Result<Vec<u8>> {
    let upper = encoded.to_ascii_uppercase();
    BASE32_NOPAD
        .decode(upper.as_bytes())
        .map_err(|e| DnsError::DecodingError(format!("base32: {}", e)))
}

/// Insert a dot every `DOT_INTERVAL` characters, aligned to the right edge
pub fn dotify(encoded: &str) -> String {
    let len = encoded.len();
    if len <= DOT_INTERVAL {
        return encoded.to_string();
    }

    let mut out = String::with_capacity(len + len / DOT_INTERVAL);
    let mut start = len % DOT_INTERVAL;
    if start > 0 {
        out.push_str(&encoded[..start]);
    }
    while start < len {
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(&encoded[start..start + DOT_INTERVAL]);
        start += DOT_INTERVAL;
    }
    out
}

/// Remove all dots
pub fn undotify(dotted: &str) -> String {
    dotted.chars().filter(|c| *c != '.').collect()
}

/// Lowercase, strip the trailing dot
pub fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

fn base32_len(payload_len: usize) -> usize {
    (payload_len * 8).div_ceil(5)
}

fn dotted_len(base32_len: usize) -> usize {
    if base32_len == 0 {
        return 0;
    }
    base32_len + (base32_len - 1) / DOT_INTERVAL
}

/// Largest payload whose QNAME still fits in 253 characters under `domain`
pub fn max_payload_len_for_domain(domain: &str) -> Result<usize> {
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() {
        return Err(DnsError::InvalidDomain("domain must not be empty".into()));
    }
    if domain.len() > MAX_DNS_NAME_LEN {
        return Err(DnsError::InvalidDomain(format!(
            "domain too long: {} bytes",
            domain.len()
        )));
    }

    // One separator between the payload labels and the domain
    let max_dotted = MAX_DNS_NAME_LEN.saturating_sub(domain.len() + 1);
    let mut max_base32 = 0usize;
    while dotted_len(max_base32 + 1) <= max_dotted {
        max_base32 += 1;
    }

    let mut max_payload = max_base32 * 5 / 8;
    while max_payload > 0 && base32_len(max_payload) > max_base32 {
        max_payload -= 1;
    }
    Ok(max_payload)
}

/// Build the fully qualified QNAME carrying `payload`
pub fn build_qname(payload: &[u8], domain: &str) -> Result<String> {
    let domain = domain.trim_end_matches('.');
    let max_payload = max_payload_len_for_domain(domain)?;
    if payload.len() > max_payload {
        return Err(DnsError::PacketTooLarge(payload.len(), max_payload));
    }

    let dotted = dotify(&base32_encode(payload));
    if dotted.is_empty() {
        return Ok(format!("{}.", domain));
    }
    Ok(format!("{}.{}.", dotted, domain))
}

/// Longest-suffix matcher over the configured tunnel domains
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    domains: Vec<String>,
}

impl DomainMatcher {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut domains: Vec<String> = domains
            .into_iter()
            .map(|d| normalize_domain(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();
        // Longest first so the first hit is the best hit
        domains.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        domains.dedup();
        Self { domains }
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Longest configured domain that `qname` equals or ends with at a label boundary
    pub fn best_match(&self, qname: &str) -> Option<&str> {
        let qname = qname.trim_end_matches('.');
        self.domains
            .iter()
            .find(|domain| {
                qname.eq_ignore_ascii_case(domain) || is_label_suffix(qname, domain)
            })
            .map(String::as_str)
    }

    /// Payload labels in front of the matched domain
    ///
    /// Every failure maps to NAME_ERROR: no match, an exact match on the
    /// domain itself, or nothing left in front of it.
    pub fn extract_subdomain<'a>(&self, qname: &'a str) -> std::result::Result<&'a str, Rcode> {
        let trimmed = qname.trim_end_matches('.');
        if trimmed.is_empty() {
            return Err(Rcode::NameError);
        }
        let domain = self.best_match(trimmed).ok_or(Rcode::NameError)?;
        if trimmed.len() <= domain.len() + 1 {
            return Err(Rcode::NameError);
        }
        let subdomain = &trimmed[..trimmed.len() - domain.len() - 1];
        if subdomain.is_empty() {
            return Err(Rcode::NameError);
        }
        Ok(subdomain)
    }

    /// Pairs where one domain is a label suffix of another
    pub fn overlapping(&self) -> Vec<(&str, &str)> {
        let mut pairs = Vec::new();
        for (i, longer) in self.domains.iter().enumerate() {
            for shorter in &self.domains[i + 1..] {
                if is_label_suffix(longer, shorter) {
                    pairs.push((longer.as_str(), shorter.as_str()));
                }
            }
        }
        pairs
    }
}

fn is_label_suffix(name: &str, domain: &str) -> bool {
    if name.len() <= domain.len() {
        return false;
    }
    let split = name.len() - domain.len();
    name.as_bytes()[split - 1] == b'.' && name[split..].eq_ignore_ascii_case(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base32_no_padding() {
        assert_eq!(base32_encode(b"ping"), "OBUW4ZY");
        assert!(!base32_encode(&[0u8; 7]).contains('='));
    }

    #[test]
    fn test_base32_case_insensitive() {
        assert_eq!(base32_decode("obuw4zy").unwrap(), b"ping");
        assert_eq!(base32_decode("ObUw4Zy").unwrap(), b"ping");
    }

    #[test]
    fn test_base32_rejects_garbage() {
        assert!(base32_decode("!!!").is_err());
        assert!(base32_decode("A").is_err());
    }

    #[test]
    fn test_dotify_right_aligned() {
        let encoded = "A".repeat(DOT_INTERVAL + 3);
        let dotted = dotify(&encoded);
        let parts: Vec<&str> = dotted.split('.').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[1].len(), DOT_INTERVAL);
    }

    #[test]
    fn test_dotify_exact_multiple() {
        let encoded = "B".repeat(DOT_INTERVAL * 2);
        let dotted = dotify(&encoded);
        assert_eq!(dotted.matches('.').count(), 1);
        assert!(!dotted.starts_with('.'));
        assert!(!dotted.ends_with('.'));
        assert_eq!(undotify(&dotted), encoded);
    }

    #[test]
    fn test_dotify_short() {
        assert_eq!(dotify("ABC"), "ABC");
        assert_eq!(dotify(""), "");
    }

    #[test]
    fn test_max_payload_fits() {
        for domain in ["t.example.com", "a.b", "x.verylongtunneldomainname.example.org"] {
            let max = max_payload_len_for_domain(domain).unwrap();
            assert!(max > 0);
            let qname = build_qname(&vec![0xAB; max], domain).unwrap();
            assert!(qname.trim_end_matches('.').len() <= MAX_DNS_NAME_LEN);
            assert!(build_qname(&vec![0xAB; max + 1], domain).is_err());
        }
    }

    #[test]
    fn test_max_payload_rejects_empty_domain() {
        assert!(max_payload_len_for_domain("").is_err());
        assert!(max_payload_len_for_domain(".").is_err());
    }

    #[test]
    fn test_build_qname_shape() {
        let qname = build_qname(b"ping", "t.example.com.").unwrap();
        assert_eq!(qname, "OBUW4ZY.t.example.com.");
    }

    #[test]
    fn test_longest_suffix_wins() {
        let matcher = DomainMatcher::new(["example.com", "t.example.com"]);
        assert_eq!(matcher.best_match("abc.t.example.com."), Some("t.example.com"));
        assert_eq!(
            matcher.extract_subdomain("abc.t.example.com."),
            Ok("abc")
        );
        assert_eq!(matcher.extract_subdomain("abc.u.example.com."), Ok("abc.u"));
    }

    #[test]
    fn test_suffix_needs_label_boundary() {
        let matcher = DomainMatcher::new(["example.com"]);
        assert_eq!(
            matcher.extract_subdomain("abcexample.com."),
            Err(Rcode::NameError)
        );
    }

    #[test]
    fn test_exact_domain_is_name_error() {
        let matcher = DomainMatcher::new(["example.com", "t.example.com"]);
        assert_eq!(
            matcher.extract_subdomain("t.example.com."),
            Err(Rcode::NameError)
        );
    }

    #[test]
    fn test_suffix_match_ignores_case() {
        let matcher = DomainMatcher::new(["T.Example.COM."]);
        assert_eq!(matcher.extract_subdomain("AbC.t.EXAMPLE.com."), Ok("AbC"));
    }

    #[test]
    fn test_overlapping_domains() {
        let matcher = DomainMatcher::new(["example.com", "t.example.com", "other.net"]);
        assert_eq!(matcher.overlapping(), vec![("t.example.com", "example.com")]);
    }
}
