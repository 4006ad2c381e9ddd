//! Byte-key encoding for the three logical namespaces (§6):
//!
//! ```text
//! log/{term_10d}:{index_10d}  -> serialized command
//! meta/currentTerm            -> integer
//! meta/votedFor                -> id string
//! meta/peers                   -> array of id strings
//! state/*                       -> user key/value pairs
//! ```
//!
//! Zero-padded decimal term/index keep `log/*` keys in `(term, index)` sort
//! order under plain byte comparison, matching §4.2's "entries are
//! materialized by sorting keys shaped `\"{term}:{index}\"`".

use crate::command::Index;
use crate::command::Term;

pub const LOG_PREFIX: &str = "log/";
pub const META_CURRENT_TERM: &str = "meta/currentTerm";
pub const META_VOTED_FOR: &str = "meta/votedFor";
pub const META_PEERS: &str = "meta/peers";
pub const STATE_PREFIX: &str = "state/";

pub fn log_key(term: Term, index: Index) -> String {
    format!("{LOG_PREFIX}{term:010}:{index:010}")
}

pub fn state_key(user_key: &str) -> String {
    format!("{STATE_PREFIX}{user_key}")
}

pub fn strip_state_prefix(key: &str) -> Option<&str> {
    key.strip_prefix(STATE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_keys_sort_by_term_then_index() {
        let mut keys = vec![log_key(2, 1), log_key(1, 5), log_key(1, 2), log_key(2, 0)];
        keys.sort();
        assert_eq!(keys, vec![log_key(1, 2), log_key(1, 5), log_key(2, 0), log_key(2, 1)]);
    }

    #[test]
    fn state_prefix_roundtrip() {
        let k = state_key("user-key");
        assert_eq!(strip_state_prefix(&k), Some("user-key"));
    }
}
