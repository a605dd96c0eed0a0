//! In-process Redis Cluster stand-in
//!
//! Each node is a std `TcpListener` on 127.0.0.1 served by its own threads.
//! All nodes share one key space and one slot ownership table that tests can
//! rearrange while clients are connected: moving a slot makes the old owner
//! answer MOVED, starting a migration makes it answer ASK for missing keys.
//! Counters record how often each node was asked for what.

use bytes::BytesMut;
use phloem_protocol::{key_hash_slot, resp, Reply};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SLOTS: usize = 16384;

#[derive(Debug, Default, Clone)]
pub struct NodeStats {
    /// Keyed commands received, including redirected ones
    pub commands: usize,
    /// CLUSTER NODES / CLUSTER SLOTS requests
    pub discovery: usize,
    pub asking: usize,
    pub auth: usize,
    pub select: Vec<u32>,
}

struct State {
    ports: Vec<u16>,
    owners: Vec<usize>,
    /// slot -> importing node
    migrating: HashMap<u16, usize>,
    data: HashMap<Vec<u8>, Vec<u8>>,
    tryagain: usize,
    clusterdown: usize,
    password: Option<String>,
    nodes_override: Option<String>,
    stats: Vec<NodeStats>,
}

/// Guard for a running mock cluster; nodes stop on drop
pub struct MockCluster {
    state: Arc<Mutex<State>>,
    stop: Arc<AtomicBool>,
    ports: Vec<u16>,
    threads: Vec<JoinHandle<()>>,
}

impl MockCluster {
    /// Start `nodes` masters with slots split evenly between them
    pub fn start(nodes: usize) -> Self {
        Self::start_with_password(nodes, None)
    }

    pub fn start_with_password(nodes: usize, password: Option<&str>) -> Self {
        let listeners: Vec<TcpListener> = (0..nodes)
            .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind mock node"))
            .collect();
        let ports: Vec<u16> =
            listeners.iter().map(|l| l.local_addr().expect("local addr").port()).collect();

        let owners = (0..SLOTS).map(|slot| slot * nodes / SLOTS).collect();
        let state = Arc::new(Mutex::new(State {
            ports: ports.clone(),
            owners,
            migrating: HashMap::new(),
            data: HashMap::new(),
            tryagain: 0,
            clusterdown: 0,
            password: password.map(str::to_string),
            nodes_override: None,
            stats: vec![NodeStats::default(); nodes],
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let threads = listeners
            .into_iter()
            .enumerate()
            .map(|(index, listener)| {
                let state = state.clone();
                let stop = stop.clone();
                thread::spawn(move || accept_loop(index, listener, state, stop))
            })
            .collect();

        Self { state, stop, ports, threads }
    }

    pub fn port(&self, node: usize) -> u16 {
        self.ports[node]
    }

    pub fn seed(&self) -> String {
        format!("127.0.0.1:{}", self.ports[0])
    }

    pub fn owner(&self, slot: u16) -> usize {
        self.state.lock().unwrap().owners[usize::from(slot)]
    }

    /// Hand `slot` to `node`; the previous owner answers MOVED from now on
    pub fn move_slot(&self, slot: u16, node: usize) {
        self.state.lock().unwrap().owners[usize::from(slot)] = node;
    }

    /// Start migrating `slot` to `node`; the owner answers ASK for keys it lacks
    pub fn start_migration(&self, slot: u16, node: usize) {
        self.state.lock().unwrap().migrating.insert(slot, node);
    }

    /// Answer the next `count` keyed commands with TRYAGAIN
    pub fn inject_tryagain(&self, count: usize) {
        self.state.lock().unwrap().tryagain = count;
    }

    /// Answer the next `count` keyed commands with CLUSTERDOWN
    pub fn inject_clusterdown(&self, count: usize) {
        self.state.lock().unwrap().clusterdown = count;
    }

    /// Serve `text` as the CLUSTER NODES reply instead of the real layout
    pub fn override_nodes(&self, text: Option<String>) {
        self.state.lock().unwrap().nodes_override = text;
    }

    pub fn set(&self, key: &str, value: &str) {
        self.state.lock().unwrap().data.insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.data.get(key.as_bytes()).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn stats(&self, node: usize) -> NodeStats {
        self.state.lock().unwrap().stats[node].clone()
    }

    pub fn total_discovery(&self) -> usize {
        self.state.lock().unwrap().stats.iter().map(|s| s.discovery).sum()
    }

    /// Find a key whose slot is owned by `node`
    pub fn key_on(&self, node: usize, prefix: &str) -> String {
        (0..)
            .map(|i| format!("{prefix}{i}"))
            .find(|key| self.owner(key_hash_slot(key.as_bytes())) == node)
            .expect("some key lands on every node")
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn accept_loop(index: usize, listener: TcpListener, state: Arc<Mutex<State>>, stop: Arc<AtomicBool>) {
    listener.set_nonblocking(true).expect("nonblocking listener");
    let mut workers = Vec::new();
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let state = state.clone();
                let stop = stop.clone();
                workers.push(thread::spawn(move || serve(index, stream, state, stop)));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(2)),
            Err(_) => break,
        }
    }
    for worker in workers {
        let _ = worker.join();
    }
}

struct Session {
    authenticated: bool,
    asking: bool,
}

fn serve(index: usize, mut stream: TcpStream, state: Arc<Mutex<State>>, stop: Arc<AtomicBool>) {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_millis(20)));
    let mut session = Session {
        authenticated: state.lock().unwrap().password.is_none(),
        asking: false,
    };
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 16 * 1024];

    while !stop.load(Ordering::SeqCst) {
        loop {
            let request = match resp::decode_from(&mut buf) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(_) => return,
            };
            let args: Vec<Vec<u8>> = match request {
                Reply::Array(items) => {
                    items.iter().filter_map(|a| a.as_bytes().map(<[u8]>::to_vec)).collect()
                }
                _ => return,
            };
            let reply = handle(index, &args, &mut session, &state);
            if stream.write_all(&reply.to_bytes()).is_err() {
                return;
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => return,
        }
    }
}

fn handle(index: usize, args: &[Vec<u8>], session: &mut Session, state: &Mutex<State>) -> Reply {
    let mut state = state.lock().unwrap();
    let Some(verb) = args.first() else {
        return Reply::error("ERR empty command");
    };
    let verb = String::from_utf8_lossy(verb).to_ascii_uppercase();

    if verb == "AUTH" {
        state.stats[index].auth += 1;
        let given = args.last().map(|p| String::from_utf8_lossy(p).into_owned());
        return match &state.password {
            Some(password) if given.as_deref() == Some(password.as_str()) => {
                session.authenticated = true;
                Reply::status("OK")
            }
            Some(_) => Reply::error("WRONGPASS invalid username-password pair or user is disabled."),
            None => Reply::error("ERR AUTH <password> called without any password configured"),
        };
    }
    if !session.authenticated {
        return Reply::error("NOAUTH Authentication required.");
    }

    match verb.as_str() {
        "PING" => return Reply::status("PONG"),
        "ASKING" => {
            state.stats[index].asking += 1;
            session.asking = true;
            return Reply::status("OK");
        }
        "SELECT" => {
            let db = args.get(1).and_then(|d| String::from_utf8_lossy(d).parse().ok());
            return match db {
                Some(db) => {
                    state.stats[index].select.push(db);
                    Reply::status("OK")
                }
                None => Reply::error("ERR invalid DB index"),
            };
        }
        "CLUSTER" => {
            state.stats[index].discovery += 1;
            let sub = args.get(1).map(|s| String::from_utf8_lossy(s).to_ascii_uppercase());
            return match sub.as_deref() {
                Some("NODES") => {
                    let text = state.nodes_override.clone().unwrap_or_else(|| nodes_text(&state, index));
                    Reply::bulk(text)
                }
                Some("SLOTS") => slots_reply(&state),
                _ => Reply::error("ERR unknown CLUSTER subcommand"),
            };
        }
        _ => {}
    }

    let asking = std::mem::replace(&mut session.asking, false);
    let keys: Vec<&[u8]> = match verb.as_str() {
        "GET" | "SET" | "INCR" => args.get(1).map(|k| vec![k.as_slice()]).unwrap_or_default(),
        "MGET" | "DEL" | "EXISTS" => args[1..].iter().map(Vec::as_slice).collect(),
        "MSET" => args[1..].iter().step_by(2).map(Vec::as_slice).collect(),
        _ => return Reply::error(format!("ERR unknown command '{verb}'")),
    };
    if keys.is_empty() {
        return Reply::error(format!("ERR wrong number of arguments for '{verb}' command"));
    }
    state.stats[index].commands += 1;

    let slot = key_hash_slot(keys[0]);
    if keys.iter().any(|k| key_hash_slot(k) != slot) {
        return Reply::error("CROSSSLOT Keys in request don't hash to the same slot");
    }
    if state.tryagain > 0 {
        state.tryagain -= 1;
        return Reply::error("TRYAGAIN Multiple keys request during rehashing of slot");
    }
    if state.clusterdown > 0 {
        state.clusterdown -= 1;
        return Reply::error("CLUSTERDOWN The cluster is down");
    }

    let owner = state.owners[usize::from(slot)];
    let importing = state.migrating.get(&slot).copied();
    if owner == index {
        if let Some(target) = importing {
            if keys.iter().any(|k| !state.data.contains_key(*k)) {
                return Reply::error(format!("ASK {slot} 127.0.0.1:{}", state.ports[target]));
            }
        }
    } else if !(asking && importing == Some(index)) {
        return Reply::error(format!("MOVED {slot} 127.0.0.1:{}", state.ports[owner]));
    }

    execute(&verb, args, &mut state.data)
}

fn execute(verb: &str, args: &[Vec<u8>], data: &mut HashMap<Vec<u8>, Vec<u8>>) -> Reply {
    let value = |k: &Vec<u8>, data: &HashMap<Vec<u8>, Vec<u8>>| match data.get(k) {
        Some(v) => Reply::bulk(v),
        None => Reply::Nil,
    };
    match verb {
        "GET" => value(&args[1], data),
        "SET" => match args.get(2) {
            Some(v) => {
                data.insert(args[1].clone(), v.clone());
                Reply::status("OK")
            }
            None => Reply::error("ERR wrong number of arguments for 'set' command"),
        },
        "INCR" => {
            let current = data
                .get(&args[1])
                .map(|v| String::from_utf8_lossy(v).parse::<i64>())
                .unwrap_or(Ok(0));
            match current {
                Ok(n) => {
                    data.insert(args[1].clone(), (n + 1).to_string().into_bytes());
                    Reply::Integer(n + 1)
                }
                Err(_) => Reply::error("ERR value is not an integer or out of range"),
            }
        }
        "MGET" => Reply::Array(args[1..].iter().map(|k| value(k, data)).collect()),
        "MSET" => {
            for pair in args[1..].chunks(2) {
                if let [k, v] = pair {
                    data.insert(k.clone(), v.clone());
                }
            }
            Reply::status("OK")
        }
        "DEL" => Reply::Integer(args[1..].iter().filter(|k| data.remove(*k).is_some()).count() as i64),
        "EXISTS" => Reply::Integer(args[1..].iter().filter(|k| data.contains_key(*k)).count() as i64),
        _ => Reply::error("ERR unknown command"),
    }
}

/// Contiguous (start, end, owner) ranges of the ownership table
fn ranges(state: &State) -> Vec<(usize, usize, usize)> {
    let mut out: Vec<(usize, usize, usize)> = Vec::new();
    for (slot, &owner) in state.owners.iter().enumerate() {
        match out.last_mut() {
            Some((_, end, o)) if *o == owner && *end + 1 == slot => *end = slot,
            _ => out.push((slot, slot, owner)),
        }
    }
    out
}

fn nodes_text(state: &State, myself: usize) -> String {
    let ranges = ranges(state);
    let mut text = String::new();
    for (index, port) in state.ports.iter().enumerate() {
        let flags = if index == myself { "myself,master" } else { "master" };
        text.push_str(&format!(
            "node{index} 127.0.0.1:{port}@{} {flags} - 0 0 {} connected",
            u32::from(*port) + 10000,
            index + 1
        ));
        for (start, end, _) in ranges.iter().filter(|r| r.2 == index) {
            if start == end {
                text.push_str(&format!(" {start}"));
            } else {
                text.push_str(&format!(" {start}-{end}"));
            }
        }
        text.push('\n');
    }
    text
}

fn slots_reply(state: &State) -> Reply {
    let rows = ranges(state)
        .into_iter()
        .map(|(start, end, owner)| {
            Reply::Array(vec![
                Reply::Integer(start as i64),
                Reply::Integer(end as i64),
                Reply::Array(vec![
                    Reply::bulk("127.0.0.1"),
                    Reply::Integer(i64::from(state.ports[owner])),
                    Reply::bulk(format!("node{owner}")),
                ]),
            ])
        })
        .collect();
    Reply::Array(rows)
}
