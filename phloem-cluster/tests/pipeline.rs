//! Pipelined commands on the blocking client

mod common;

use common::config_for;
use common::mock_cluster::MockCluster;
use phloem_cluster::{ClusterClient, ErrorKind, NodeAddr, Reply};
use phloem_protocol::slot_for_key;

fn connected(cluster: &MockCluster) -> ClusterClient {
    let mut client = ClusterClient::new(config_for(cluster)).unwrap();
    client.connect().unwrap();
    client
}

#[test]
fn test_replies_in_append_order_across_nodes() {
    let cluster = MockCluster::start(3);
    let mut client = connected(&cluster);
    let keys: Vec<String> = (0..3).map(|n| cluster.key_on(n, "p")).collect();

    for (i, key) in keys.iter().enumerate() {
        client.append_command(["SET", key.as_str(), i.to_string().as_str()]).unwrap();
    }
    for key in keys.iter().rev() {
        client.append_command(["GET", key.as_str()]).unwrap();
    }
    assert_eq!(client.pending(), 6);

    for _ in 0..3 {
        assert_eq!(client.get_reply().unwrap(), Some(Reply::status("OK")));
    }
    let values: Vec<Reply> = (0..3).map(|_| client.get_reply().unwrap().unwrap()).collect();
    assert_eq!(values, vec![Reply::bulk("2"), Reply::bulk("1"), Reply::bulk("0")]);
    assert_eq!(client.get_reply().unwrap(), None);
}

#[test]
fn test_fragmented_command_in_pipeline() {
    let cluster = MockCluster::start(3);
    let a = cluster.key_on(0, "a");
    let b = cluster.key_on(2, "b");
    cluster.set(&a, "1");
    cluster.set(&b, "2");
    let mut client = connected(&cluster);

    client.append_command(["MGET", b.as_str(), a.as_str()]).unwrap();
    client.append_command(["INCR", a.as_str()]).unwrap();

    assert_eq!(
        client.get_reply().unwrap(),
        Some(Reply::Array(vec![Reply::bulk("2"), Reply::bulk("1")]))
    );
    assert_eq!(client.get_reply().unwrap(), Some(Reply::Integer(2)));
}

#[test]
fn test_moved_in_pipeline_is_returned_and_refreshes_on_reset() {
    let cluster = MockCluster::start(3);
    let key = cluster.key_on(0, "m");
    let slot = slot_for_key(&key);
    let mut client = connected(&cluster);
    let discovery_before = cluster.total_discovery();

    cluster.move_slot(slot, 1);
    client.append_command(["GET", key.as_str()]).unwrap();
    let reply = client.get_reply().unwrap().unwrap();
    assert!(reply.as_error().unwrap().starts_with("MOVED"));
    assert_eq!(cluster.total_discovery(), discovery_before);

    client.reset();
    assert_eq!(cluster.total_discovery(), discovery_before + 1);
    assert_eq!(client.topology().addr_for_slot(slot).unwrap().port, cluster.port(1));
}

#[test]
fn test_reset_discards_unread_replies() {
    let cluster = MockCluster::start(3);
    let key = cluster.key_on(1, "r");
    let mut client = connected(&cluster);

    client.append_command(["SET", key.as_str(), "x"]).unwrap();
    client.append_command(["GET", key.as_str()]).unwrap();
    client.reset();
    assert_eq!(client.pending(), 0);
    assert_eq!(client.get_reply().unwrap(), None);

    // the connection is still in step
    assert_eq!(client.command(["GET", key.as_str()]).unwrap(), Reply::bulk("x"));
}

#[test]
fn test_append_to_node() {
    let cluster = MockCluster::start(3);
    let mut client = connected(&cluster);
    let addr = NodeAddr::new("127.0.0.1", cluster.port(2));

    client.append_command_to_node(&addr, ["PING"]).unwrap();
    client.append_formatted_command(&b"*2\r\n$3\r\nGET\r\n$4\r\nnone\r\n"[..]).unwrap();
    assert_eq!(client.get_reply().unwrap(), Some(Reply::status("PONG")));
    assert_eq!(client.get_reply().unwrap(), Some(Reply::Nil));
}

#[test]
fn test_append_rejects_local_errors() {
    let cluster = MockCluster::start(3);
    let mut client = connected(&cluster);

    let err = client.append_command(["PING"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Routing);
    let err = client.append_command(["NOTACOMMAND", "k"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    assert_eq!(client.pending(), 0);
}

#[test]
fn test_direct_commands_wait_for_pipeline() {
    let cluster = MockCluster::start(3);
    let key = cluster.key_on(0, "mix");
    let mut client = connected(&cluster);

    client.append_command(["SET", key.as_str(), "queued"]).unwrap();
    let err = client.command(["GET", key.as_str()]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Routing);
    let addr = NodeAddr::new("127.0.0.1", cluster.port(0));
    assert!(client.command_to_node(&addr, ["PING"]).is_err());
    assert!(client.refresh().is_err());
    assert_eq!(client.pending(), 1);

    // the queued reply is still first in line
    assert_eq!(client.get_reply().unwrap(), Some(Reply::status("OK")));
    assert_eq!(client.command(["GET", key.as_str()]).unwrap(), Reply::bulk("queued"));
}
