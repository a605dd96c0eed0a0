//! Wire-level building blocks for talking to a Redis Cluster
//!
//! - [`resp`]: RESP reply decoding and encoding
//! - [`command`]: strict parsing of encoded commands and key extraction
//! - [`slot`]: key to hash slot mapping with `{hashtag}` support
//! - [`redirect`]: MOVED / ASK / TRYAGAIN / CLUSTERDOWN classification
//!
//! # Example
//!
//! ```
//! use phloem_protocol::{key_hash_slot, Command};
//!
//! let cmd = Command::from_args(["MGET", "{user:1}.name", "{user:1}.email"]).unwrap();
//! assert_eq!(cmd.slot(), Some(key_hash_slot(b"user:1")));
//! ```

pub mod addr;
pub mod command;
pub mod crc16;
pub mod redirect;
pub mod resp;
pub mod slot;

pub use addr::{parse_port, AddrError, NodeAddr};
pub use command::{
    encode_args, format_command, Command, CommandKind, KeyPosition, KeyRule, ParseError,
};
pub use redirect::{classify, parse_redirect, Redirect, RedirectError};
pub use resp::{Reply, ReplyDecoder, RespError};
pub use slot::{key_hash_slot, slot_for_key, CLUSTER_SLOTS, MAX_SLOT};
