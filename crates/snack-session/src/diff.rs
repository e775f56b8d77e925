//! Line-level diffing against the last object-store anchor, plus the
//! transport-charge estimator used by the spill decision.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;

/// Bytes the transport charges per publish on top of the encoded payload.
const PUBLISH_ENVELOPE_OVERHEAD: usize = 100;

/// Characters left untouched by `encodeURIComponent`, which is how the
/// transport measures payloads before accepting them.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Produce a patch turning `prev` into `next`. Identical inputs yield an
/// empty patch. The format is a single zero-context hunk:
///
/// ```text
/// @@ -<start>,<removed> +<start>,<added> @@
/// -removed line
/// +added line
/// ```
///
/// `start` is the 1-based index of the first differing line. The patch
/// length is bounded by `|prev| + |next|` plus the header, and
/// `diff("", s)` reconstructs `s` from nothing.
pub fn diff(prev: &str, next: &str) -> String {
    if prev == next {
        return String::new();
    }

    let old: Vec<&str> = prev.split('\n').collect();
    let new: Vec<&str> = next.split('\n').collect();

    let mut prefix = 0;
    while prefix < old.len() && prefix < new.len() && old[prefix] == new[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old.len() - prefix
        && suffix < new.len() - prefix
        && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let removed = &old[prefix..old.len() - suffix];
    let added = &new[prefix..new.len() - suffix];

    let mut patch = format!(
        "@@ -{},{} +{},{} @@",
        prefix + 1,
        removed.len(),
        prefix + 1,
        added.len()
    );
    for line in removed {
        patch.push_str("\n-");
        patch.push_str(line);
    }
    for line in added {
        patch.push_str("\n+");
        patch.push_str(line);
    }
    patch
}

/// Invert a patch produced by [`diff`] against its anchor.
#[cfg(test)]
pub fn apply(anchor: &str, patch: &str) -> String {
    if patch.is_empty() {
        return anchor.to_string();
    }
    let mut lines = patch.split('\n');
    let header = lines.next().expect("patch header");
    let header = header
        .strip_prefix("@@ -")
        .and_then(|rest| rest.strip_suffix(" @@"))
        .expect("hunk header");
    let (old_range, _new_range) = header.split_once(" +").expect("two ranges");
    let (start, removed) = old_range.split_once(',').expect("start,count");
    let start: usize = start.parse::<usize>().expect("start") - 1;
    let removed: usize = removed.parse().expect("count");

    let mut added = Vec::new();
    let mut stripped = 0usize;
    for line in lines {
        if let Some(added_line) = line.strip_prefix('+') {
            added.push(added_line);
        } else if line.strip_prefix('-').is_some() {
            stripped += 1;
        } else {
            panic!("malformed patch line: {line:?}");
        }
    }
    assert_eq!(stripped, removed, "removed count matches patch body");

    let old: Vec<&str> = anchor.split('\n').collect();
    let mut result: Vec<&str> = Vec::with_capacity(old.len() - removed + added.len());
    result.extend_from_slice(&old[..start]);
    result.extend_from_slice(&added);
    result.extend_from_slice(&old[start + removed..]);
    result.join("\n")
}

/// Estimate the bytes the transport will charge for publishing `payload`
/// on `channel`, including the envelope overhead.
pub fn payload_size(channel: &str, payload: &Value) -> usize {
    let encoded = serde_json::to_string(payload).unwrap_or_default();
    encode_uri_component(&encoded).len() + channel.len() + PUBLISH_ENVELOPE_OVERHEAD
}

/// `encodeURIComponent` equivalent, shared with the CDN probe URLs.
pub(crate) fn encode_uri_component(raw: &str) -> String {
    utf8_percent_encode(raw, URI_COMPONENT).collect()
}
