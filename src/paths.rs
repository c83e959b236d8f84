//! Path layout shared by the lock and election recipes.
//!
//! All state lives under a configurable root. A lock named `N` queues its
//! requests as sequential ephemeral children of `<root>/<escaped N>`; an
//! election named `N` does the same under `<root>/<N>`, with one extra
//! distinguished child (`leader_ack`) written by the winner.

/// Default root node for locks.
pub const DEFAULT_LOCK_ROOT: &str = "/_zklocking";

/// Default root node for elections.
pub const DEFAULT_ELECTION_ROOT: &str = "/_zkelection";

/// Name of the node an election winner creates once its winning callbacks
/// have completed.
pub const LEADER_ACK_NODE: &str = "leader_ack";

/// Child-name prefix of exclusive lock requests (and election votes).
pub(crate) const EXCLUSIVE_PREFIX: &str = "ex";

/// Child-name prefix of shared lock requests.
pub(crate) const SHARED_PREFIX: &str = "sh";

/// Escape a lock name so it forms a single path component: slashes become
/// double underscores.
pub fn escape_name(name: &str) -> String {
    name.replace('/', "__")
}

/// The last component of a path.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Join a parent path and a child name.
pub(crate) fn join(parent: &str, child: &str) -> String {
    format!("{}/{}", parent, child)
}

/// Split a sequential child name into its prefix and the server-assigned
/// sequence number, e.g. `"ex0000000042"` into `("ex", 42)`.
///
/// Names without a trailing decimal run (such as `leader_ack`) yield `None`
/// and are thereby excluded from queue ordering.
pub(crate) fn split_sequence(name: &str) -> Option<(&str, u64)> {
    let digits = name
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    if digits == name.len() {
        return None;
    }
    let seq = name[digits..].parse().ok()?;
    Some((&name[..digits], seq))
}

/// Order child names by their sequence number, dropping children that carry
/// no sequence suffix. Acquisition order is determined solely by this
/// ordering.
pub(crate) fn sequence_ordered(children: Vec<String>) -> Vec<String> {
    let mut numbered: Vec<(u64, String)> = children
        .into_iter()
        .filter_map(|c| {
            let seq = split_sequence(&c).map(|(_, seq)| seq);
            seq.map(|seq| (seq, c))
        })
        .collect();
    numbered.sort_by_key(|&(seq, _)| seq);
    numbered.into_iter().map(|(_, c)| c).collect()
}

/// Does this child name belong to an exclusive request?
pub(crate) fn is_exclusive(name: &str) -> bool {
    matches!(split_sequence(name), Some((EXCLUSIVE_PREFIX, _)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping() {
        assert_eq!(escape_name("foo"), "foo");
        assert_eq!(escape_name("foo/bar"), "foo__bar");
        assert_eq!(escape_name("/foo/bar"), "__foo__bar");
    }

    #[test]
    fn sequence_parsing() {
        assert_eq!(split_sequence("ex0000000000"), Some(("ex", 0)));
        assert_eq!(split_sequence("sh0000000123"), Some(("sh", 123)));
        assert_eq!(split_sequence("leader_ack"), None);
        assert_eq!(split_sequence("ex"), None);
        // sequence counters larger than ten digits still parse
        assert_eq!(split_sequence("ex10000000000"), Some(("ex", 10000000000)));
    }

    #[test]
    fn ordering_is_by_sequence_only() {
        let children = vec![
            "sh0000000002".to_string(),
            "ex0000000010".to_string(),
            "leader_ack".to_string(),
            "ex0000000001".to_string(),
        ];
        assert_eq!(
            sequence_ordered(children),
            vec!["ex0000000001", "sh0000000002", "ex0000000010"]
        );
    }

    #[test]
    fn basenames() {
        assert_eq!(basename("/_zklocking/foo/ex0000000000"), "ex0000000000");
        assert_eq!(basename("ex0000000000"), "ex0000000000");
    }
}
