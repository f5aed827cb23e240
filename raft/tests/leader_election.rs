//! Election Safety and the election/failover scenarios from spec §8
//! (S1, S3): a single-node cluster is its own leader immediately; a
//! three-node cluster converges on exactly one leader; isolating that
//! leader forces a new election among the remaining majority.

mod support;

use std::time::Duration;

use support::TestCluster;

const ELECTION_TIMEOUT_MS: u64 = 30;
const CONVERGE: Duration = Duration::from_secs(3);

#[tokio::test]
async fn single_node_cluster_commits_immediately() {
	// S1: N=1, submit "hello", observe a commit at the first LogPos.
	let cluster = TestCluster::start(1, ELECTION_TIMEOUT_MS).await;
	assert!(cluster.wait_for_leader(CONVERGE).await.is_some(), "the sole node must become leader on its own");

	let pos = cluster.submit(b"hello", CONVERGE).await.expect("single-node save must commit");
	assert!(cluster.wait_for_commits(0, 1, CONVERGE).await);
	assert_eq!(cluster.observer(0).payloads(), vec![b"hello".to_vec()]);
	assert_eq!(cluster.observer(0).len(), 1);
	let _ = pos;
}

#[tokio::test]
async fn three_node_cluster_converges_on_one_leader() {
	let cluster = TestCluster::start(3, ELECTION_TIMEOUT_MS).await;
	let leader = cluster.wait_for_leader(CONVERGE).await;
	assert!(leader.is_some(), "a healthy three-node cluster must elect a leader");
}

#[tokio::test]
async fn leader_isolation_triggers_reelection_among_the_remaining_majority() {
	// S3: isolate the leader; the other two elect a new leader within a few
	// election timeouts and continue committing writes.
	let mut cluster = TestCluster::start(3, ELECTION_TIMEOUT_MS).await;
	let first_leader = cluster.wait_for_leader(CONVERGE).await.expect("must elect an initial leader");

	cluster.submit(b"before-partition", CONVERGE).await.expect("must commit while fully healthy");

	cluster.pause_node(first_leader as usize);

	// The isolated node's own election timer never fires a result anyone can
	// observe (its messages are all dropped); the new leader must emerge
	// from the remaining two within a handful of election timeouts and
	// start accepting writes again. `submit` itself round-robins past a
	// leader hint, so it is enough to retry it until one succeeds.
	let deadline = std::time::Instant::now() + CONVERGE;
	let mut committed = false;
	while std::time::Instant::now() < deadline {
		if cluster.submit(b"after-partition", Duration::from_millis(200)).await.is_ok() {
			committed = true;
			break;
		}
	}
	assert!(committed, "remaining majority must elect a new leader and accept writes");

	cluster.resume_node(first_leader as usize);
}
