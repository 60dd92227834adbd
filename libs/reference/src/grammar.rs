//! Component grammar for image references.
//!
//! Hand-written matchers equivalent to the distribution reference grammar:
//!
//! ```text
//! registry   := host [":" port]
//! host       := label ("." label)*          label := [A-Za-z0-9] ([A-Za-z0-9-]* [A-Za-z0-9])?
//! repository := component ("/" component)*
//! component  := [a-z0-9]+ (separator [a-z0-9]+)*   separator := "." | "_" | "__" | "-"+
//! tag        := [A-Za-z0-9_] [A-Za-z0-9_.-]{0,127}
//! digest     := algorithm ":" hex{32,}
//! algorithm  := [A-Za-z][A-Za-z0-9]* ([-_+.][A-Za-z][A-Za-z0-9]*)*
//! ```

/// Maximum length of a repository path.
pub const MAX_REPOSITORY_LEN: usize = 255;

/// Maximum length of a tag.
pub const MAX_TAG_LEN: usize = 128;

/// Minimum number of hex characters in a digest.
pub const MIN_DIGEST_HEX_LEN: usize = 32;

/// Returns true if `registry` is a valid `host[:port]`.
pub fn is_valid_registry(registry: &str) -> bool {
    let (host, port) = match registry.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (registry, None),
    };

    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }

    !host.is_empty() && host.split('.').all(is_valid_host_label)
}

fn is_valid_host_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        }
        _ => false,
    }
}

/// Returns true if `repository` is a valid slash-separated repository path.
pub fn is_valid_repository(repository: &str) -> bool {
    !repository.is_empty()
        && repository.len() <= MAX_REPOSITORY_LEN
        && repository.split('/').all(is_valid_path_component)
}

fn is_valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    match (bytes.first(), bytes.last()) {
        (Some(&first), Some(&last)) if alnum(first) && alnum(last) => {}
        _ => return false,
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }

        // A separator run: ".", "_", "__" or one or more "-".
        let start = i;
        match bytes[i] {
            b'.' => i += 1,
            b'_' => {
                i += 1;
                if i < bytes.len() && bytes[i] == b'_' {
                    i += 1;
                }
            }
            b'-' => {
                while i < bytes.len() && bytes[i] == b'-' {
                    i += 1;
                }
            }
            _ => return false,
        }

        if i == start || i >= bytes.len() || !alnum(bytes[i]) {
            return false;
        }
    }

    true
}

/// Returns true if `tag` is a valid image tag.
pub fn is_valid_tag(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    let Some(&first) = bytes.first() else {
        return false;
    };

    bytes.len() <= MAX_TAG_LEN
        && (first.is_ascii_alphanumeric() || first == b'_')
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Returns true if `digest` is a valid `<algorithm>:<hex>` content digest.
pub fn is_valid_digest(digest: &str) -> bool {
    let Some((algorithm, encoded)) = digest.split_once(':') else {
        return false;
    };

    is_valid_algorithm(algorithm)
        && encoded.len() >= MIN_DIGEST_HEX_LEN
        && encoded.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_valid_algorithm(algorithm: &str) -> bool {
    algorithm
        .split(['-', '_', '+', '.'])
        .all(|part| {
            let mut bytes = part.bytes();
            matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic())
                && bytes.all(|b| b.is_ascii_alphanumeric())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        assert!(is_valid_registry("ghcr.io"));
        assert!(is_valid_registry("localhost:5000"));
        assert!(is_valid_registry("my-registry.example.com:443"));
        assert!(!is_valid_registry("-bad.io"));
        assert!(!is_valid_registry("bad..io"));
        assert!(!is_valid_registry("host:"));
        assert!(!is_valid_registry("host:port"));
    }

    #[test]
    fn test_repository_components() {
        assert!(is_valid_repository("library/alpine"));
        assert!(is_valid_repository("a/b/c"));
        assert!(is_valid_repository("foo_bar"));
        assert!(is_valid_repository("foo__bar"));
        assert!(is_valid_repository("foo---bar"));
        assert!(is_valid_repository("foo.bar"));
        assert!(!is_valid_repository("foo___bar"));
        assert!(!is_valid_repository("foo..bar"));
        assert!(!is_valid_repository("Foo"));
        assert!(!is_valid_repository("foo/"));
        assert!(!is_valid_repository("-foo"));
        assert!(!is_valid_repository("bad ref!!"));
    }

    #[test]
    fn test_repository_length_limit() {
        assert!(!is_valid_repository(&"a".repeat(MAX_REPOSITORY_LEN + 1)));
        assert!(is_valid_repository(&"a".repeat(MAX_REPOSITORY_LEN)));
    }

    #[test]
    fn test_tag() {
        assert!(is_valid_tag("latest"));
        assert!(is_valid_tag("v1.2.3-rc.1"));
        assert!(is_valid_tag("_private"));
        assert!(!is_valid_tag(""));
        assert!(!is_valid_tag(".hidden"));
        assert!(!is_valid_tag("has space"));
        assert!(!is_valid_tag(&"a".repeat(MAX_TAG_LEN + 1)));
    }

    #[test]
    fn test_digest() {
        let hex = "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";
        assert!(is_valid_digest(&format!("sha256:{hex}")));
        assert!(is_valid_digest(&format!("multihash+base58:{hex}")));
        assert!(!is_valid_digest("sha256:abc"));
        assert!(!is_valid_digest(hex));
        assert!(!is_valid_digest(&format!("256:{hex}")));
        assert!(!is_valid_digest(&format!("sha256:{hex}zz")));
    }
}
