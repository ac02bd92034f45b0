//! Path Parser.
//!
//! Encodes an [`ObjectIdentifier`] as a repo-relative file path under a
//! Target's base path, and decodes it back. The two directions are exact
//! inverses: `parse(encode(I, B), B) == I` for every identifier, and
//! `encode(parse(p, B), B) == p` for every valid `p`.
//!
//! The first path segment under `B` is always the API group; the core
//! group (rendered as `""` in `apiVersion`) is normalized to the literal
//! segment `core`. An empty path segment can't survive a real filesystem:
//! `mkdir -p live//v1` and `mkdir -p live/v1` produce the same directory,
//! so the Folder Reconciler's directory walk can never recover a literal
//! empty segment once a file has actually been written to disk. `core` is
//! not a real Kubernetes API group name, so the mapping is unambiguous.

use reverser_types::{GroupVersionResource, ObjectIdentifier};

const CORE_GROUP_SEGMENT: &str = "core";

/// Encode an identifier as a path relative to the repository root, given
/// the Target's base path. `base` may or may not have a trailing slash.
pub fn encode(id: &ObjectIdentifier, base: &str) -> String {
    let base = base.trim_end_matches('/');
    let group_segment = if id.gvr.group.is_empty() { CORE_GROUP_SEGMENT } else { id.gvr.group.as_str() };
    let mut segments: Vec<String> = vec![group_segment.to_string(), id.gvr.version.clone(), id.gvr.resource.clone()];
    if let Some(ns) = &id.namespace {
        segments.push(ns.clone());
    }
    segments.push(format!("{}.yaml", id.name));

    if base.is_empty() {
        segments.join("/")
    } else {
        format!("{base}/{}", segments.join("/"))
    }
}

/// Errors returned when a path cannot be decoded as a resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("path {0:?} is not under base path {1:?}")]
    NotUnderBase(String, String),
    #[error("path {0:?} does not end in .yaml")]
    NotYaml(String),
    #[error("path {0:?} has too few segments to be a resource path")]
    TooShort(String),
}

/// Decode a path relative to the repository root into an identifier,
/// given the Target's base path. Uses component-wise prefix stripping
/// (not a raw string `starts_with`) so that a base of `live` never
/// matches a sibling directory like `live2/...`.
pub fn parse(full_path: &str, base: &str) -> Result<ObjectIdentifier, ParseError> {
    let relative = strip_base(full_path, base)
        .ok_or_else(|| ParseError::NotUnderBase(full_path.to_string(), base.to_string()))?;

    let Some(name_with_ext) = relative.rsplit('/').next() else {
        return Err(ParseError::TooShort(full_path.to_string()));
    };
    let Some(name) = name_with_ext.strip_suffix(".yaml") else {
        return Err(ParseError::NotYaml(full_path.to_string()));
    };
    if name.is_empty() {
        return Err(ParseError::NotYaml(full_path.to_string()));
    }

    let segments: Vec<&str> = relative.split('/').collect();
    // [group, version, resource, name.yaml]            -- cluster-scoped
    // [group, version, resource, namespace, name.yaml]  -- namespaced
    match segments.as_slice() {
        [group, version, resource, _name_file] => Ok(ObjectIdentifier::cluster_scoped(
            GroupVersionResource::new(decode_group(group), *version, *resource),
            name,
        )),
        [group, version, resource, namespace, _name_file] => Ok(ObjectIdentifier::namespaced(
            GroupVersionResource::new(decode_group(group), *version, *resource),
            *namespace,
            name,
        )),
        _ => Err(ParseError::TooShort(full_path.to_string())),
    }
}

fn decode_group(segment: &str) -> String {
    if segment == CORE_GROUP_SEGMENT { String::new() } else { segment.to_string() }
}

/// Strip `base` from `full_path` at a path-component boundary. Returns
/// `None` if `full_path` is not actually under `base` (e.g. `base="live"`
/// must not match `full_path="live2/..."`).
fn strip_base<'a>(full_path: &'a str, base: &str) -> Option<&'a str> {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return Some(full_path.trim_start_matches('/'));
    }
    let stripped = full_path.strip_prefix(base)?;
    stripped.strip_prefix('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encode_namespaced_core_group() {
        let id = ObjectIdentifier::namespaced(
            GroupVersionResource::new("", "v1", "configmaps"),
            "team",
            "cm-a",
        );
        assert_eq!(encode(&id, "live/"), "live/core/v1/configmaps/team/cm-a.yaml");
        assert_eq!(encode(&id, "live"), "live/core/v1/configmaps/team/cm-a.yaml");
    }

    #[test]
    fn encode_cluster_scoped() {
        let id = ObjectIdentifier::cluster_scoped(
            GroupVersionResource::new("rbac.authorization.k8s.io", "v1", "clusterroles"),
            "admin",
        );
        assert_eq!(
            encode(&id, "live/"),
            "live/rbac.authorization.k8s.io/v1/clusterroles/admin.yaml"
        );
    }

    #[test]
    fn parse_inverts_encode_namespaced() {
        let id = ObjectIdentifier::namespaced(
            GroupVersionResource::new("", "v1", "configmaps"),
            "team",
            "cm-a",
        );
        let encoded = encode(&id, "live/");
        let decoded = parse(&encoded, "live/").expect("parse");
        assert_eq!(decoded, id);
    }

    #[test]
    fn parse_inverts_encode_cluster_scoped() {
        let id = ObjectIdentifier::cluster_scoped(
            GroupVersionResource::new("apps", "v1", "deployments_cluster_fixture"),
            "x",
        );
        let encoded = encode(&id, "base");
        let decoded = parse(&encoded, "base").expect("parse");
        assert_eq!(decoded, id);
    }

    #[test]
    fn encode_inverts_parse() {
        let path = "live/core/v1/configmaps/team/cm-a.yaml";
        let id = parse(path, "live").expect("parse");
        assert_eq!(encode(&id, "live"), path);
    }

    /// A real file path can never contain an empty directory component —
    /// `core` must survive exactly the same path a directory walk would
    /// hand back, with no double slash to reconstruct.
    #[test]
    fn core_group_path_has_no_empty_segment() {
        let id = ObjectIdentifier::namespaced(GroupVersionResource::new("", "v1", "configmaps"), "team", "cm-a");
        let encoded = encode(&id, "live");
        assert!(!encoded.contains("//"), "encoded path must not contain an empty segment: {encoded}");
    }

    /// Base `live/` must not treat a path under a sibling directory
    /// prefixed by the same characters (`live2/...`) as though it were
    /// under `live/`.
    #[test]
    fn path_prefix_safety_rejects_sibling_directory() {
        let result = parse("live2/core/v1/configmaps/team/oeps3.yaml", "live");
        assert!(matches!(result, Err(ParseError::NotUnderBase(_, _))));
    }

    #[test]
    fn path_prefix_safety_accepts_exact_base() {
        let result = parse("live/core/v1/configmaps/team/oeps3.yaml", "live");
        assert!(result.is_ok());
    }

    #[test]
    fn parse_rejects_non_yaml() {
        let result = parse("live/core/v1/configmaps/team/cm-a.json", "live");
        assert!(matches!(result, Err(ParseError::NotYaml(_))));
    }

    #[test]
    fn parse_rejects_too_short() {
        let result = parse("live/core/v1", "live");
        assert!(matches!(result, Err(ParseError::TooShort(_))));
    }

    fn arb_segment() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,12}"
    }

    proptest! {
        #[test]
        fn parse_encode_bijection_namespaced(
            group in prop_oneof![Just(String::new()), arb_segment()],
            version in arb_segment(),
            resource in arb_segment(),
            namespace in arb_segment(),
            name in arb_segment(),
        ) {
            let id = ObjectIdentifier::namespaced(
                GroupVersionResource::new(group, version, resource),
                namespace,
                name,
            );
            let encoded = encode(&id, "live");
            let decoded = parse(&encoded, "live").expect("parse must succeed for encoded path");
            prop_assert_eq!(decoded.clone(), id.clone());
            prop_assert_eq!(encode(&decoded, "live"), encoded);
        }

        #[test]
        fn parse_encode_bijection_cluster_scoped(
            group in prop_oneof![Just(String::new()), arb_segment()],
            version in arb_segment(),
            resource in arb_segment(),
            name in arb_segment(),
        ) {
            let id = ObjectIdentifier::cluster_scoped(
                GroupVersionResource::new(group, version, resource),
                name,
            );
            let encoded = encode(&id, "live");
            let decoded = parse(&encoded, "live").expect("parse must succeed for encoded path");
            prop_assert_eq!(decoded, id);
        }
    }
}
