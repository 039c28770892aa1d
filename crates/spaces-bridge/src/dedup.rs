//! Content dedup for egress: an exact blake3 hash of `(content,
//! ordered_attachment_metadata)` as the primary key into the per-channel
//! hash index (spec §4.7 "Egress" step 3), plus a fuzzy Jaccard-similarity
//! fallback reused near-verbatim from the teacher's article-title dedup
//! (`rostra-bot/src/dedup.rs`) for the case where Discord's copy of a
//! message was edited slightly by a client before the bridge ever saw it.

use std::collections::BTreeSet;

use spaces_core::ContentHash;

/// Minimum Jaccard similarity for two message bodies to be considered the
/// same message for the fuzzy fallback pass.
pub const CONTENT_SIMILARITY_THRESHOLD: f64 = 0.9;

/// Skip Jaccard comparison for bodies with fewer tokens than this — short
/// messages ("lol", "+1") are too ambiguous to dedup fuzzily.
pub const MIN_CONTENT_TOKENS: usize = 4;

/// One attachment's dedup-relevant metadata: filename and byte size.
/// Ordered the same way the message lists them, since order is part of
/// what makes two attachment sets "the same" (spec §4.7: "ordered
/// attachment metadata").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentMeta {
    pub filename: String,
    pub size: u64,
}

/// Computes the exact content hash the egress path hashes and looks up:
/// `(content, ordered_attachment_metadata)` (spec §4.7 "Egress" step 3).
pub fn content_hash(body: &str, attachments: &[AttachmentMeta]) -> ContentHash {
    let mut buf = Vec::with_capacity(body.len() + attachments.len() * 32);
    buf.extend_from_slice(body.as_bytes());
    for attachment in attachments {
        buf.push(0); // separator, avoids "a" + "b" colliding with "ab"
        buf.extend_from_slice(attachment.filename.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&attachment.size.to_le_bytes());
    }
    ContentHash::of(&buf)
}

/// Normalize a message body for fuzzy comparison: lowercase, collapse
/// non-alphanumeric runs to single spaces, collapse whitespace.
pub fn normalize_content(body: &str) -> String {
    let lowered = body.to_lowercase();
    let replaced: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn content_tokens(normalized: &str) -> BTreeSet<&str> {
    normalized.split_whitespace().collect()
}

pub fn jaccard_similarity(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// True if two message bodies are fuzzy-duplicates: both have enough
/// tokens to compare and their Jaccard similarity clears the threshold.
pub fn is_fuzzy_duplicate(a: &str, b: &str) -> bool {
    let (na, nb) = (normalize_content(a), normalize_content(b));
    let (ta, tb) = (content_tokens(&na), content_tokens(&nb));
    if ta.len() < MIN_CONTENT_TOKENS || tb.len() < MIN_CONTENT_TOKENS {
        return false;
    }
    jaccard_similarity(&ta, &tb) >= CONTENT_SIMILARITY_THRESHOLD
}

/// Discord's own message-id namespace provides the 25-char truncation the
/// spec calls a "nonce" (spec §4.7 "Egress" step 1): truncate the Roomy
/// event id's text form to the first 25 characters.
pub fn event_id_to_nonce(event_id: spaces_core::Ulid) -> String {
    let text = event_id.to_string();
    text.chars().take(25).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_same_input_same_hash() {
        let atts = vec![AttachmentMeta { filename: "a.png".into(), size: 100 }];
        assert_eq!(content_hash("hi", &atts), content_hash("hi", &atts));
    }

    #[test]
    fn content_hash_differs_by_attachment_order() {
        let a = vec![
            AttachmentMeta { filename: "a.png".into(), size: 1 },
            AttachmentMeta { filename: "b.png".into(), size: 2 },
        ];
        let b = vec![
            AttachmentMeta { filename: "b.png".into(), size: 2 },
            AttachmentMeta { filename: "a.png".into(), size: 1 },
        ];
        assert_ne!(content_hash("hi", &a), content_hash("hi", &b));
    }

    #[test]
    fn content_hash_no_ambiguous_concatenation() {
        // "ab" + "" must not collide with "a" + "b" just because the raw
        // bytes would concatenate the same way without a separator.
        let empty: Vec<AttachmentMeta> = vec![];
        let h1 = content_hash("ab", &empty);
        let h2 = content_hash("a", &[AttachmentMeta { filename: "b".into(), size: 0 }]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn fuzzy_duplicate_near_identical() {
        assert!(is_fuzzy_duplicate(
            "just shipped the new release notes for v2",
            "Just shipped the new release notes for v2!"
        ));
    }

    #[test]
    fn fuzzy_duplicate_unrelated_not_flagged() {
        assert!(!is_fuzzy_duplicate(
            "just shipped the new release notes for v2",
            "can someone review my pull request please"
        ));
    }

    #[test]
    fn fuzzy_duplicate_short_messages_never_compared() {
        assert!(!is_fuzzy_duplicate("lol", "lol"));
    }

    #[test]
    fn nonce_truncates_to_25_chars() {
        let id = spaces_core::Ulid::generate();
        let nonce = event_id_to_nonce(id);
        assert!(nonce.chars().count() <= 25);
    }
}
