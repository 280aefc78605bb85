//! History deduplication
//!
//! Two entries are duplicates when role, sender id, text and the first 100
//! characters of the inline image match.  The newest copy wins and the
//! result keeps chronological order.

use std::collections::HashSet;

use super::{HistoryEntry, HistoryRole};

const IMAGE_SIGNATURE_CHARS: usize = 100;

#[derive(Debug, PartialEq, Eq, Hash)]
struct Signature<'a> {
    role: HistoryRole,
    user_id: &'a str,
    text: &'a str,
    image_prefix: Option<String>,
}

impl<'a> Signature<'a> {
    fn of(entry: &'a HistoryEntry) -> Self {
        Self {
            role: entry.role,
            user_id: &entry.user_id,
            text: &entry.text,
            image_prefix: entry
                .image_base64_uri
                .as_deref()
                .filter(|uri| !uri.is_empty())
                .map(|uri| uri.chars().take(IMAGE_SIGNATURE_CHARS).collect()),
        }
    }
}

pub fn dedup_history(entries: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    let keep: Vec<bool> = {
        let mut seen = HashSet::with_capacity(entries.len());
        let mut keep = vec![false; entries.len()];
        for (index, entry) in entries.iter().enumerate().rev() {
            if seen.insert(Signature::of(entry)) {
                keep[index] = true;
            }
        }
        keep
    };

    let before = entries.len();
    let deduped: Vec<HistoryEntry> = entries
        .into_iter()
        .zip(keep)
        .filter_map(|(entry, keep)| keep.then_some(entry))
        .collect();
    if deduped.len() != before {
        tracing::debug!(removed = before - deduped.len(), "Deduplicated history entries");
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(role: HistoryRole, user: &str, text: &str, id: &str) -> HistoryEntry {
        HistoryEntry {
            role,
            name: user.into(),
            user_id: user.into(),
            time: String::new(),
            text: text.into(),
            message_id: id.into(),
            image_base64_uri: None,
        }
    }

    #[test]
    fn keeps_newest_copy_in_order() {
        let entries = vec![
            entry(HistoryRole::User, "u1", "hi", "a"),
            entry(HistoryRole::User, "u2", "yo", "b"),
            entry(HistoryRole::User, "u1", "hi", "c"),
            entry(HistoryRole::Assistant, "u1", "hi", "d"),
        ];
        let ids: Vec<String> = dedup_history(entries)
            .into_iter()
            .map(|e| e.message_id)
            .collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
    }

    #[test]
    fn image_prefix_distinguishes_entries() {
        let mut a = entry(HistoryRole::User, "u1", "[image]", "a");
        let mut b = entry(HistoryRole::User, "u1", "[image]", "b");
        a.image_base64_uri = Some(format!("base64://{}", "A".repeat(200)));
        b.image_base64_uri = Some(format!("base64://{}", "B".repeat(200)));
        assert_eq!(dedup_history(vec![a.clone(), b]).len(), 2);

        // identical in the first 100 chars collapses
        let mut c = a.clone();
        c.message_id = "c".into();
        c.image_base64_uri = Some(format!("base64://{}Z", "A".repeat(200)));
        assert_eq!(dedup_history(vec![a, c]).len(), 1);
    }

    #[test]
    fn dedup_is_idempotent() {
        let entries = vec![
            entry(HistoryRole::User, "u1", "hi", "a"),
            entry(HistoryRole::User, "u1", "hi", "b"),
            entry(HistoryRole::Assistant, "bot", "hello", "c"),
            entry(HistoryRole::Assistant, "bot", "hello", "d"),
            entry(HistoryRole::User, "u2", "sup", "e"),
        ];
        let once = dedup_history(entries);
        let twice = dedup_history(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }
}
