//! Splitting multi-key commands across slots
//!
//! MGET, DEL, EXISTS and MSET whose keys hash to several slots are split
//! into one sub-command per slot. Keys keep their first-seen grouping order
//! and each key remembers which sub-command carries it, so the merged reply
//! lists values in the caller's key order.

use crate::error::{ClusterError, Result};
use phloem_protocol::{key_hash_slot, Command, CommandKind, Reply};

/// True for the command kinds that can be split by slot
pub fn is_fragmentable(kind: CommandKind) -> bool {
    matches!(kind, CommandKind::MGet | CommandKind::Del | CommandKind::Exists | CommandKind::MSet)
}

/// One per-slot sub-command
#[derive(Debug, Clone)]
pub struct Fragment {
    pub slot: u16,
    pub command: Command,
    /// Number of keys this sub-command carries
    pub keys: usize,
}

/// A command split by slot
#[derive(Debug, Clone)]
pub struct Fragments {
    kind: CommandKind,
    parts: Vec<Fragment>,
    /// Sub-command index for each key of the original command
    frag_seq: Vec<usize>,
}

impl Fragments {
    /// Split `cmd` by slot
    ///
    /// Callers only split commands whose keys span several slots; a command
    /// of any other kind in that situation cannot be served.
    pub fn split(cmd: &Command) -> Result<Self> {
        if !is_fragmentable(cmd.kind()) {
            return Err(ClusterError::cross_slot());
        }
        let verb = cmd.arg(0).unwrap_or_default();
        let pairs = cmd.kind() == CommandKind::MSet;

        let mut groups: Vec<(u16, Vec<&[u8]>)> = Vec::new();
        let mut frag_seq = Vec::with_capacity(cmd.keys().len());
        for (i, key) in cmd.key_bytes().enumerate() {
            let slot = key_hash_slot(key);
            let index = match groups.iter().position(|(s, _)| *s == slot) {
                Some(index) => index,
                None => {
                    groups.push((slot, vec![verb]));
                    groups.len() - 1
                }
            };
            let args = &mut groups[index].1;
            args.push(key);
            if pairs {
                let value = cmd.value(i).ok_or_else(|| {
                    ClusterError::ProtocolMismatch("MSET key without value".to_string())
                })?;
                args.push(value);
            }
            frag_seq.push(index);
        }

        let parts = groups
            .into_iter()
            .map(|(slot, args)| -> Result<Fragment> {
                let keys = if pairs { (args.len() - 1) / 2 } else { args.len() - 1 };
                Ok(Fragment { slot, command: Command::from_args(args)?, keys })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { kind: cmd.kind(), parts, frag_seq })
    }

    pub fn parts(&self) -> &[Fragment] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Combine one reply per sub-command, in sub-command order
    ///
    /// An error reply from any sub-command is returned unchanged.
    pub fn merge(&self, replies: Vec<Reply>) -> Result<Reply> {
        if replies.len() != self.parts.len() {
            return Err(mismatch(format!(
                "expected {} sub-replies, got {}",
                self.parts.len(),
                replies.len()
            )));
        }
        if let Some(err) = replies.iter().find(|r| r.is_error()) {
            return Ok(err.clone());
        }

        match self.kind {
            CommandKind::MGet => self.merge_mget(replies),
            CommandKind::Del | CommandKind::Exists => {
                let mut total: i64 = 0;
                for reply in &replies {
                    let n = reply.as_integer().ok_or_else(|| unexpected(reply))?;
                    total = total.saturating_add(n);
                }
                Ok(Reply::Integer(total))
            }
            CommandKind::MSet => {
                let mut first = None;
                for reply in replies {
                    match reply {
                        Reply::Status(_) => {
                            first.get_or_insert(reply);
                        }
                        other => return Err(unexpected(&other)),
                    }
                }
                first.ok_or_else(|| mismatch("no sub-replies".to_string()))
            }
            other => Err(mismatch(format!("cannot merge replies of {}", other.name()))),
        }
    }

    fn merge_mget(&self, replies: Vec<Reply>) -> Result<Reply> {
        let mut columns = Vec::with_capacity(replies.len());
        for (part, reply) in self.parts.iter().zip(replies) {
            match reply {
                Reply::Array(items) if items.len() == part.keys => {
                    columns.push(items.into_iter())
                }
                Reply::Array(items) => {
                    return Err(mismatch(format!(
                        "sub-reply has {} elements for {} keys",
                        items.len(),
                        part.keys
                    )))
                }
                other => return Err(unexpected(&other)),
            }
        }

        let mut values = Vec::with_capacity(self.frag_seq.len());
        for &index in &self.frag_seq {
            let value = columns[index]
                .next()
                .ok_or_else(|| mismatch("sub-reply ran out of elements".to_string()))?;
            values.push(value);
        }
        Ok(Reply::Array(values))
    }
}

fn mismatch(msg: String) -> ClusterError {
    ClusterError::ProtocolMismatch(msg)
}

fn unexpected(reply: &Reply) -> ClusterError {
    mismatch(format!("unexpected {} sub-reply", reply.type_name()))
}
