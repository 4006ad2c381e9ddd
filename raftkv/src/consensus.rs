//! Consensus seek (§4.4): quorum + explicit demanded voters, used for both
//! writes and the read-consensus barrier. Each `consensus` set in the passed
//! list runs independently, in order; membership change (§4.3) is the only
//! caller that passes more than one.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::address::NodeId;
use crate::command::Index;
use crate::error::RaftError;
use crate::peer_replicator::PeerReplicatorHandle;
use crate::quorum;

/// Run one `_waitForConsensus` pass (§4.4) against a single voter set.
///
/// `replicators` must already contain a live entry for every address in
/// `consensus_set` and `also_wait_for` other than `local_id` — creating
/// temporary replicators for voters outside the normal peer set is the
/// caller's job (§4.4: "For each voter lacking a replicator, create a
/// temporary one"), since only `Node` has the dependencies to spawn one.
pub async fn wait_for_consensus(
    local_id: &NodeId,
    consensus_set: &HashSet<NodeId>,
    also_wait_for: &HashSet<NodeId>,
    replicators: &HashMap<NodeId, PeerReplicatorHandle>,
    target_index: Index,
    timeout: Duration,
) -> Result<(), RaftError> {
    let voters: HashSet<NodeId> = consensus_set
        .union(also_wait_for)
        .filter(|v| *v != local_id)
        .cloned()
        .collect();
    // Self counts as one vote implicitly (§4.4).
    let total_voters = voters.len() + 1;
    let quorum_needed = quorum::majority_of(total_voters);

    let mut watchers: Vec<(NodeId, watch::Receiver<Index>)> = voters
        .iter()
        .filter_map(|v| replicators.get(v).map(|r| (v.clone(), r.match_index.clone())))
        .collect();

    let mut confirmed: HashSet<NodeId> = HashSet::new();
    for (id, rx) in &watchers {
        if *rx.borrow() >= target_index {
            confirmed.insert(id.clone());
        }
    }

    let deadline = Instant::now() + timeout;
    loop {
        let votes = 1 + confirmed.len();
        let alsowaitfor_satisfied = also_wait_for
            .iter()
            .all(|a| a == local_id || confirmed.contains(a));
        if quorum::has_quorum(votes, total_voters) && alsowaitfor_satisfied {
            return Ok(());
        }
        // Early loss detection: if the remaining not-yet-confirmed voters
        // can no longer reach quorum even if every one of them votes yes,
        // there is no point waiting out the full timeout.
        let still_possible = votes + watchers.len().saturating_sub(confirmed.len());
        if !quorum::has_quorum(still_possible, total_voters) {
            return Err(RaftError::NoMajority);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RaftError::Timeout);
        }

        match tokio::time::timeout(remaining, wait_for_any_change(&mut watchers)).await {
            Ok(Some(id)) => {
                if let Some((_, rx)) = watchers.iter().find(|(wid, _)| *wid == id) {
                    if *rx.borrow() >= target_index {
                        confirmed.insert(id);
                    }
                }
            }
            Ok(None) => {
                // No watchers left to change; nothing more can happen before
                // the deadline, so fall through and let the loop re-check or
                // time out on the next iteration.
                if watchers.is_empty() {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(RaftError::Timeout);
                    }
                    tokio::time::sleep(remaining.min(Duration::from_millis(50))).await;
                }
            }
            Err(_) => return Err(RaftError::Timeout),
        }
    }
}

async fn wait_for_any_change(watchers: &mut Vec<(NodeId, watch::Receiver<Index>)>) -> Option<NodeId> {
    if watchers.is_empty() {
        return None;
    }
    let futs: Vec<_> = watchers.iter_mut().map(|(_, rx)| Box::pin(rx.changed())).collect();
    let (result, idx, _rest) = select_all(futs).await;
    let id = watchers[idx].0.clone();
    if result.is_err() {
        watchers.remove(idx);
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeId {
        NodeId::parse(&format!("/ip4/127.0.0.1/tcp/{port}")).unwrap()
    }

    #[tokio::test]
    async fn self_only_reaches_quorum_of_one() {
        let local = node(9101);
        let result = wait_for_consensus(
            &local,
            &HashSet::new(),
            &HashSet::new(),
            &HashMap::new(),
            1,
            Duration::from_millis(100),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_replicator_for_sole_voter_times_out() {
        let local = node(9101);
        let mut voters = HashSet::new();
        voters.insert(node(9102));
        voters.insert(node(9103));
        // 3 voters total (including self), quorum is 2. Neither peer has a
        // replicator registered, so neither can ever confirm: loss is
        // detected immediately rather than waiting out the timeout.
        let result = wait_for_consensus(
            &local,
            &voters,
            &HashSet::new(),
            &HashMap::new(),
            1,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(RaftError::NoMajority)));
    }
}
