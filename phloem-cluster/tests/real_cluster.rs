//! Tests against a real Redis Cluster
//!
//! Point `PHLOEM_CLUSTER_SEEDS` at one or more nodes and run with:
//! `PHLOEM_CLUSTER_SEEDS=127.0.0.1:7000 cargo test --test real_cluster -- --ignored`

use phloem_cluster::{AsyncClusterClient, ClusterClient, ClusterConfig, Reply};

fn config() -> ClusterConfig {
    let seeds = std::env::var("PHLOEM_CLUSTER_SEEDS")
        .expect("PHLOEM_CLUSTER_SEEDS must name the cluster seeds");
    ClusterConfig::with_seeds(&seeds).expect("valid seeds")
}

#[test]
#[ignore]
fn test_real_cluster_round_trip() {
    let mut client = ClusterClient::new(config()).unwrap();
    client.connect().unwrap();
    assert_eq!(client.topology().covered_slots(), 16384);

    let keys: Vec<String> = (0..16).map(|i| format!("phloem:test:{i}")).collect();
    for key in &keys {
        assert_eq!(client.command(["SET", key.as_str(), key.as_str()]).unwrap(), Reply::status("OK"));
    }
    let mut mget = vec!["MGET"];
    mget.extend(keys.iter().map(String::as_str));
    let reply = client.command(mget).unwrap();
    let values = reply.as_array().unwrap();
    for (key, value) in keys.iter().zip(values) {
        assert_eq!(value.as_str(), Some(key.as_str()));
    }

    let mut del = vec!["DEL"];
    del.extend(keys.iter().map(String::as_str));
    assert_eq!(client.command(del).unwrap(), Reply::Integer(keys.len() as i64));
}

#[tokio::test]
#[ignore]
async fn test_real_cluster_async() {
    let client = AsyncClusterClient::new(config()).unwrap();
    client.connect().await.unwrap();
    client.command(["SET", "phloem:async", "1"]).await.unwrap();
    assert_eq!(client.command(["INCR", "phloem:async"]).await.unwrap(), Reply::Integer(2));
    client.command(["DEL", "phloem:async"]).await.unwrap();
}
