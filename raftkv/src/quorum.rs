//! Quorum arithmetic shared by election and consensus-seek (§4.4).

/// The smallest count that is strictly more than half of `n`.
pub fn majority_of(n: usize) -> usize {
    n / 2 + 1
}

/// Whether `votes` pro-votes out of `voters` total (self included) forms a
/// quorum.
pub fn has_quorum(votes: usize, voters: usize) -> bool {
    votes >= majority_of(voters)
}

/// Whether the remaining possible votes can no longer reach a quorum, i.e.
/// the vote has already failed (§4.4: "symmetric check for contra-votes
/// permits early loss detection").
pub fn quorum_unreachable(contra_votes: usize, voters: usize) -> bool {
    let needed = majority_of(voters);
    voters.saturating_sub(contra_votes) < needed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_table() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(2), 2);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
        assert_eq!(majority_of(6), 4);
    }

    #[test]
    fn quorum_checks() {
        assert!(has_quorum(2, 3));
        assert!(!has_quorum(1, 3));
        assert!(has_quorum(3, 4));
        assert!(!has_quorum(2, 4));
    }

    #[test]
    fn early_loss_detection() {
        // 5 voters, majority is 3. Two contra-votes still leaves 3
        // reachable.
        assert!(!quorum_unreachable(2, 5));
        // Three contra-votes leaves only 2 reachable: quorum is lost.
        assert!(quorum_unreachable(3, 5));
    }
}
