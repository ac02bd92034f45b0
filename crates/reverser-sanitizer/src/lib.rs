//! Sanitizer: strips server-managed fields from a captured API object and
//! produces a deterministic, canonical YAML rendering — equal inputs
//! always yield byte-identical output. This is what lets the Branch
//! Worker detect a no-op UPSERT by comparing bytes, and what keeps Git
//! diffs meaningful instead of churning on `resourceVersion` bumps.

use std::collections::BTreeMap;

use reverser_types::StructuredDocument;
use serde_json::Value as JsonValue;

/// Metadata fields that are always server-managed and never belong in Git.
const STRIPPED_METADATA_FIELDS: &[&str] = &[
    "creationTimestamp",
    "uid",
    "resourceVersion",
    "generation",
    "managedFields",
    "selfLink",
];

/// Produce the sanitized form of a captured object: strip server-managed
/// fields, leave everything else untouched. Idempotent:
/// `sanitize(sanitize(x)) == sanitize(x)`, since re-stripping already-absent
/// fields is a no-op.
pub fn sanitize(doc: &StructuredDocument) -> StructuredDocument {
    let mut value = doc.as_value().clone();
    strip_in_place(&mut value);
    StructuredDocument::new(value)
}

fn strip_in_place(value: &mut JsonValue) {
    let JsonValue::Object(map) = value else {
        return;
    };

    map.remove("status");

    if let Some(JsonValue::Object(metadata)) = map.get_mut("metadata") {
        for field in STRIPPED_METADATA_FIELDS {
            metadata.remove(*field);
        }
        if matches!(metadata.get("annotations"), Some(JsonValue::Object(a)) if a.is_empty()) {
            metadata.remove("annotations");
        }
    }
}

/// Strip an additional, caller-specified dotted field path (for
/// server-defaulted fields that are specific to one resource kind, e.g.
/// `spec.clusterIP` on a headless Service). Paths are dot-separated;
/// the final segment is removed from its parent object if present.
pub fn strip_field_path(doc: &StructuredDocument, path: &str) -> StructuredDocument {
    let mut value = doc.as_value().clone();
    let segments: Vec<&str> = path.split('.').collect();
    remove_path(&mut value, &segments);
    StructuredDocument::new(value)
}

fn remove_path(value: &mut JsonValue, segments: &[&str]) {
    let (Some((last, parents)), JsonValue::Object(_)) = (segments.split_last(), &value) else {
        return;
    };
    let mut cur = value;
    for segment in parents {
        match cur.get_mut(*segment) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let JsonValue::Object(map) = cur {
        map.remove(*last);
    }
}

/// Render a sanitized document as canonical, deterministic YAML: map keys
/// sorted lexicographically at every nesting level, block style, stable
/// scalar formatting. Two calls on structurally-equal documents always
/// produce byte-identical output.
pub fn canonicalize_yaml(doc: &StructuredDocument) -> Result<String, serde_yaml::Error> {
    let sorted = to_sorted_yaml_value(doc.as_value());
    serde_yaml::to_string(&sorted)
}

fn to_sorted_yaml_value(value: &JsonValue) -> serde_yaml::Value {
    match value {
        JsonValue::Null => serde_yaml::Value::Null,
        JsonValue::Bool(b) => serde_yaml::Value::Bool(*b),
        JsonValue::Number(n) => serde_yaml::Value::String(canonical_number(n)),
        JsonValue::String(s) => serde_yaml::Value::String(s.clone()),
        JsonValue::Array(items) => {
            serde_yaml::Value::Sequence(items.iter().map(to_sorted_yaml_value).collect())
        }
        JsonValue::Object(map) => {
            let sorted: BTreeMap<&String, &JsonValue> = map.iter().collect();
            let mut mapping = serde_yaml::Mapping::new();
            for (k, v) in sorted {
                mapping.insert(serde_yaml::Value::String(k.clone()), to_sorted_yaml_value(v));
            }
            serde_yaml::Value::Mapping(mapping)
        }
    }
}

/// Render a JSON number in a single stable textual form so that
/// `1`, `1.0`, and `1e0` (which `serde_json` can each produce depending on
/// the decoder) never diverge in canonical output. Integers are rendered
/// without a decimal point; floats use Rust's default `Display`, which is
/// round-trippable and exponent-free for all finite values this pipeline
/// ever sees (Kubernetes API objects carry no NaN/Infinity).
///
/// Numbers are intentionally rendered as YAML strings rather than bare
/// scalars: `serde_yaml` would otherwise re-infer a type on decode and can
/// reformat (e.g. drop a trailing `.0`), which would break byte-identical
/// round trips for the only thing that matters here — comparing two
/// canonicalizations of the same input.
fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        i.to_string()
    } else if let Some(u) = n.as_u64() {
        u.to_string()
    } else if let Some(f) = n.as_f64() {
        format!("{f}")
    } else {
        n.to_string()
    }
}
