//! S4: a follower that is stopped while the rest of the cluster keeps
//! committing catches back up, via the leader's AppendEntries backlog, once
//! it restarts — it converges on every entry it missed and observes each
//! exactly once.

mod support;

use std::time::Duration;

use support::TestCluster;

#[tokio::test]
async fn stopped_follower_converges_after_restart() {
	let mut cluster = TestCluster::start(3, 30).await;
	let leader = cluster.wait_for_leader(Duration::from_secs(3)).await.expect("cluster must elect a leader");

	let follower = (0..3).find(|idx| *idx as raft::NodeId != leader).expect("a three-node cluster has at least one follower");

	cluster.stop_node(follower).await;

	const N: usize = 25;
	for i in 0..N {
		let payload = format!("entry-{}", i);
		cluster
			.submit(payload.as_bytes(), Duration::from_secs(3))
			.await
			.unwrap_or_else(|e| panic!("entry {} must commit with a quorum of two still up: {}", i, e));
	}

	cluster.start_node(follower).await;

	assert!(
		cluster.wait_for_commits(follower, N, Duration::from_secs(5)).await,
		"restarted follower must converge on every entry committed while it was down"
	);
	let expected: Vec<Vec<u8>> = (0..N).map(|i| format!("entry-{}", i).into_bytes()).collect();
	assert_eq!(cluster.observer(follower).payloads(), expected);
}
