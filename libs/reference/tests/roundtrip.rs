//! Property and table tests for reference parsing.

use proptest::prelude::*;
use rstest::rstest;
use stevedore_reference::{ImageReference, ReferenceError};

fn component() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}([._-][a-z0-9]{1,8}){0,2}"
}

fn registry() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some("ghcr.io".to_string())),
        Just(Some("localhost:5000".to_string())),
        "[a-z]{1,8}\\.example\\.com(:[0-9]{2,5})?".prop_map(Some),
    ]
}

fn suffix() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[A-Za-z0-9_][A-Za-z0-9_.-]{0,20}".prop_map(|tag| format!(":{tag}")),
        "[0-9a-f]{64}".prop_map(|hex| format!("@sha256:{hex}")),
    ]
}

proptest! {
    #[test]
    fn parse_display_parse_is_stable(
        registry in registry(),
        path in prop::collection::vec(component(), 1..4),
        suffix in suffix(),
    ) {
        let mut text = String::new();
        if let Some(registry) = &registry {
            text.push_str(registry);
            text.push('/');
        }
        text.push_str(&path.join("/"));
        text.push_str(&suffix);

        let parsed = ImageReference::parse(&text).unwrap();
        let reparsed = ImageReference::parse(&parsed.to_string()).unwrap();
        prop_assert_eq!(&parsed, &reparsed);

        let with_tag = ImageReference::parse(&parsed.to_string_with_tag()).unwrap();
        prop_assert_eq!(with_tag.registry(), parsed.registry());
        prop_assert_eq!(with_tag.repository(), parsed.repository());
        prop_assert_eq!(with_tag.reference(), parsed.reference());
    }

    #[test]
    fn tag_and_digest_are_exclusive(text in "[a-z]{1,6}(:[a-z]{1,4})?(@sha256:[0-9a-f]{64})?") {
        if let Ok(parsed) = ImageReference::parse(&text) {
            prop_assert!(!(parsed.tag().is_some() && parsed.digest().is_some()));
        }
    }
}

#[rstest]
#[case("alpine", "registry-1.docker.io", "library/alpine", "latest")]
#[case("myuser/myapp:v1", "registry-1.docker.io", "myuser/myapp", "v1")]
#[case("ghcr.io/org/repo:v2", "ghcr.io", "org/repo", "v2")]
#[case("localhost/app", "localhost", "app", "latest")]
#[case("localhost:5000/myimage:dev", "localhost:5000", "myimage", "dev")]
#[case("gcr.io/project/image:latest", "gcr.io", "project/image", "latest")]
#[case("hjrn_ux.083c/app", "registry-1.docker.io", "hjrn_ux.083c/app", "latest")]
#[case("my_org.v2/tools/cli:1.0", "registry-1.docker.io", "my_org.v2/tools/cli", "1.0")]
fn parses_components(
    #[case] input: &str,
    #[case] registry: &str,
    #[case] repository: &str,
    #[case] reference: &str,
) {
    let parsed = ImageReference::parse(input).unwrap();
    assert_eq!(parsed.registry(), registry);
    assert_eq!(parsed.repository(), repository);
    assert_eq!(parsed.reference(), reference);
}

#[rstest]
#[case("")]
#[case("bad ref!!")]
#[case("UPPER/case")]
#[case("repo:")]
#[case("repo@")]
#[case("repo@sha256:1234")]
#[case("ghcr.io/")]
#[case("a//b")]
#[case("bad_host:x/app")]
fn rejects_malformed(#[case] input: &str) {
    let err: ReferenceError = ImageReference::parse(input).unwrap_err();
    assert!(!err.to_string().is_empty());
}
