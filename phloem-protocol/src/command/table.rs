//! Static verb table
//!
//! Maps each supported verb to a [`CommandKind`] tag and the rule that says
//! where its keys are. Lookup is case-insensitive.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Verbs longer than this are never in the table
const MAX_VERB_LEN: usize = 32;

/// Number of arguments that follow the key of a single-key command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

/// Where the keys of a command are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRule {
    /// No keys at all (PING, QUIT, AUTH)
    None,
    /// First argument is the key, followed by the given number of arguments
    Single(Arity),
    /// Every argument is a key (MGET, DEL, EXISTS)
    Vector,
    /// Arguments alternate key and value (MSET)
    KeyValuePairs,
    /// A sub-command token precedes the key (XGROUP CREATE key ...)
    SubcommandKey,
    /// `script numkeys key...` with at least one key
    Eval,
    /// Keys follow the STREAMS keyword; the first `skip` arguments are never the keyword
    StreamsKeyword { skip: usize },
}

#[derive(Debug)]
pub struct CommandDef {
    pub name: &'static str,
    pub kind: CommandKind,
    pub rule: KeyRule,
}

const K0: KeyRule = KeyRule::Single(Arity::Exact(0));
const K1: KeyRule = KeyRule::Single(Arity::Exact(1));
const K2: KeyRule = KeyRule::Single(Arity::Exact(2));
const K3: KeyRule = KeyRule::Single(Arity::Exact(3));

const fn kn(min: usize) -> KeyRule {
    KeyRule::Single(Arity::AtLeast(min))
}

macro_rules! command_table {
    ($($kind:ident => $name:literal, $rule:expr;)+) => {
        /// Tag for every supported verb
        ///
        /// `Unknown` marks commands that were not parsed, such as those sent
        /// straight to a named node.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CommandKind {
            Unknown,
            $($kind,)+
        }

        static COMMANDS: &[CommandDef] = &[
            $(CommandDef { name: $name, kind: CommandKind::$kind, rule: $rule },)+
        ];

        impl CommandKind {
            /// Upper-case verb text
            pub fn name(self) -> &'static str {
                match self {
                    CommandKind::Unknown => "UNKNOWN",
                    $(CommandKind::$kind => $name,)+
                }
            }
        }
    };
}

command_table! {
    // keys
    Del => "DEL", KeyRule::Vector;
    Exists => "EXISTS", KeyRule::Vector;
    Expire => "EXPIRE", kn(1);
    ExpireAt => "EXPIREAT", kn(1);
    PExpire => "PEXPIRE", kn(1);
    PExpireAt => "PEXPIREAT", kn(1);
    Persist => "PERSIST", K0;
    PTtl => "PTTL", K0;
    Sort => "SORT", kn(0);
    Ttl => "TTL", K0;
    Type => "TYPE", K0;
    // strings
    Append => "APPEND", K1;
    BitCount => "BITCOUNT", kn(0);
    Decr => "DECR", K0;
    DecrBy => "DECRBY", K1;
    Dump => "DUMP", K0;
    Get => "GET", K0;
    GetBit => "GETBIT", K1;
    GetRange => "GETRANGE", K2;
    GetSet => "GETSET", K1;
    Incr => "INCR", K0;
    IncrBy => "INCRBY", K1;
    IncrByFloat => "INCRBYFLOAT", K1;
    MGet => "MGET", KeyRule::Vector;
    MSet => "MSET", KeyRule::KeyValuePairs;
    PSetEx => "PSETEX", K2;
    Restore => "RESTORE", kn(2);
    Set => "SET", kn(1);
    SetBit => "SETBIT", K2;
    SetEx => "SETEX", K2;
    SetNx => "SETNX", K1;
    SetRange => "SETRANGE", K2;
    StrLen => "STRLEN", K0;
    // hashes
    HDel => "HDEL", kn(1);
    HExists => "HEXISTS", K1;
    HGet => "HGET", K1;
    HGetAll => "HGETALL", K0;
    HIncrBy => "HINCRBY", K2;
    HIncrByFloat => "HINCRBYFLOAT", K2;
    HKeys => "HKEYS", K0;
    HLen => "HLEN", K0;
    HMGet => "HMGET", kn(1);
    HMSet => "HMSET", kn(2);
    HSet => "HSET", kn(2);
    HSetNx => "HSETNX", K2;
    HScan => "HSCAN", kn(1);
    HVals => "HVALS", K0;
    // lists
    LIndex => "LINDEX", K1;
    LInsert => "LINSERT", K3;
    LLen => "LLEN", K0;
    LPop => "LPOP", kn(0);
    LPush => "LPUSH", kn(1);
    LPushX => "LPUSHX", kn(1);
    LRange => "LRANGE", K2;
    LRem => "LREM", K2;
    LSet => "LSET", K2;
    LTrim => "LTRIM", K2;
    RPop => "RPOP", kn(0);
    RPopLPush => "RPOPLPUSH", K1;
    RPush => "RPUSH", kn(1);
    RPushX => "RPUSHX", kn(1);
    // hyperloglog
    PfAdd => "PFADD", kn(0);
    PfCount => "PFCOUNT", kn(0);
    PfMerge => "PFMERGE", kn(0);
    // sets
    SAdd => "SADD", kn(1);
    SCard => "SCARD", K0;
    SDiff => "SDIFF", kn(0);
    SDiffStore => "SDIFFSTORE", kn(1);
    SInter => "SINTER", kn(0);
    SInterStore => "SINTERSTORE", kn(1);
    SIsMember => "SISMEMBER", K1;
    SMembers => "SMEMBERS", K0;
    SMove => "SMOVE", K2;
    SPop => "SPOP", kn(0);
    SRandMember => "SRANDMEMBER", kn(0);
    SRem => "SREM", kn(1);
    SUnion => "SUNION", kn(0);
    SUnionStore => "SUNIONSTORE", kn(1);
    SScan => "SSCAN", kn(1);
    // streams
    XAck => "XACK", kn(2);
    XAdd => "XADD", kn(3);
    XAutoClaim => "XAUTOCLAIM", kn(4);
    XClaim => "XCLAIM", kn(4);
    XDel => "XDEL", kn(1);
    XGroup => "XGROUP", KeyRule::SubcommandKey;
    XInfo => "XINFO", KeyRule::SubcommandKey;
    XLen => "XLEN", K0;
    XPending => "XPENDING", kn(1);
    XRange => "XRANGE", kn(2);
    XRead => "XREAD", KeyRule::StreamsKeyword { skip: 0 };
    XReadGroup => "XREADGROUP", KeyRule::StreamsKeyword { skip: 3 };
    XRevRange => "XREVRANGE", kn(2);
    XTrim => "XTRIM", kn(2);
    // sorted sets
    ZAdd => "ZADD", kn(2);
    ZCard => "ZCARD", K0;
    ZCount => "ZCOUNT", K2;
    ZIncrBy => "ZINCRBY", K2;
    ZInterStore => "ZINTERSTORE", kn(2);
    ZLexCount => "ZLEXCOUNT", K2;
    ZRange => "ZRANGE", kn(2);
    ZRangeByLex => "ZRANGEBYLEX", kn(2);
    ZRangeByScore => "ZRANGEBYSCORE", kn(2);
    ZRank => "ZRANK", kn(1);
    ZRem => "ZREM", kn(1);
    ZRemRangeByRank => "ZREMRANGEBYRANK", K2;
    ZRemRangeByLex => "ZREMRANGEBYLEX", K2;
    ZRemRangeByScore => "ZREMRANGEBYSCORE", K2;
    ZRevRange => "ZREVRANGE", kn(2);
    ZRevRangeByScore => "ZREVRANGEBYSCORE", kn(2);
    ZRevRank => "ZREVRANK", kn(1);
    ZScore => "ZSCORE", K1;
    ZUnionStore => "ZUNIONSTORE", kn(2);
    ZScan => "ZSCAN", kn(1);
    // scripting
    Eval => "EVAL", KeyRule::Eval;
    EvalSha => "EVALSHA", KeyRule::Eval;
    // connection
    Ping => "PING", KeyRule::None;
    Quit => "QUIT", KeyRule::None;
    Auth => "AUTH", KeyRule::None;
}

fn table() -> &'static HashMap<&'static str, &'static CommandDef> {
    static TABLE: OnceLock<HashMap<&'static str, &'static CommandDef>> = OnceLock::new();
    TABLE.get_or_init(|| COMMANDS.iter().map(|def| (def.name, def)).collect())
}

/// Find the definition of `verb`, ignoring ASCII case
pub fn lookup(verb: &[u8]) -> Option<&'static CommandDef> {
    if verb.is_empty() || verb.len() > MAX_VERB_LEN {
        return None;
    }
    let mut upper = [0u8; MAX_VERB_LEN];
    let upper = &mut upper[..verb.len()];
    upper.copy_from_slice(verb);
    upper.make_ascii_uppercase();
    let name = std::str::from_utf8(upper).ok()?;
    table().get(name).copied()
}

/// All supported verbs, in table order
pub fn all_commands() -> impl Iterator<Item = &'static CommandDef> {
    COMMANDS.iter()
}
