//! Key-value primitive layer.
//!
//! Backends implement a single operation, [`KvStore::execute`], over a
//! [`Pipeline`] of commands. Queuing a command hands back a typed [`Slot`]; the
//! matching reply is pulled out of [`Replies`] with [`Replies::take`], so callers
//! never index into a heterogeneous result array by hand.
//!
//! The single-command helpers in [`KvExt`] are one-command pipelines.

use std::{collections::HashMap, marker::PhantomData, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use thiserror::Error;
use tracing::warn;

pub(crate) const METRIC_KV_ERROR_TOTAL: &str = "feedtally_kv_error_total";

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv connection failed: {0}")]
    Connection(String),
    #[error("kv command failed: {0}")]
    Command(String),
    #[error("unexpected reply to `{command}`: expected {expected}")]
    UnexpectedReply {
        command: &'static str,
        expected: &'static str,
    },
    #[error("no reply available for pipeline slot {index}")]
    MissingReply { index: usize },
}

impl KvError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::Command(message.into())
    }

    fn unexpected(command: &'static str, expected: &'static str) -> Self {
        Self::UnexpectedReply { command, expected }
    }
}

/// Sorted-set traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// One store command. Sorted-set ranges always carry scores.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get { key: String },
    SetEx { key: String, value: Bytes, ttl: Duration },
    SetNxEx { key: String, value: Bytes, ttl: Duration },
    IncrBy { key: String, delta: i64 },
    Del { keys: Vec<String> },
    Expire { key: String, ttl: Duration },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    SMembers { key: String },
    SIsMember { key: String, member: String },
    HSet { key: String, field: String, value: i64 },
    HIncrBy { key: String, field: String, delta: i64 },
    HGetAll { key: String },
    HDel { key: String, field: String },
    ZAdd { key: String, member: String, score: f64 },
    ZIncrBy { key: String, member: String, delta: f64 },
    ZRange {
        key: String,
        start: isize,
        stop: isize,
        order: Order,
    },
    ZRemRangeByRank { key: String, start: isize, stop: isize },
    ZScan { key: String, cursor: u64, count: usize },
    ZScore { key: String, member: String },
    ZRem { key: String, member: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::SetEx { .. } | Command::SetNxEx { .. } => "SET",
            Command::IncrBy { .. } => "INCRBY",
            Command::Del { .. } => "DEL",
            Command::Expire { .. } => "EXPIRE",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::SMembers { .. } => "SMEMBERS",
            Command::SIsMember { .. } => "SISMEMBER",
            Command::HSet { .. } => "HSET",
            Command::HIncrBy { .. } => "HINCRBY",
            Command::HGetAll { .. } => "HGETALL",
            Command::HDel { .. } => "HDEL",
            Command::ZAdd { .. } => "ZADD",
            Command::ZIncrBy { .. } => "ZINCRBY",
            Command::ZRange {
                order: Order::Asc, ..
            } => "ZRANGE",
            Command::ZRange {
                order: Order::Desc,
                ..
            } => "ZREVRANGE",
            Command::ZRemRangeByRank { .. } => "ZREMRANGEBYRANK",
            Command::ZScan { .. } => "ZSCAN",
            Command::ZScore { .. } => "ZSCORE",
            Command::ZRem { .. } => "ZREM",
        }
    }
}

/// Whole-second TTL accepted by the store; `EX 0` is rejected, so clamp to one.
pub fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Backend-neutral reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Double(f64),
    Data(Bytes),
    Array(Vec<Reply>),
}

impl Reply {
    fn into_string(self, command: &'static str) -> Result<String, KvError> {
        match self {
            Reply::Data(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|_| KvError::unexpected(command, "utf-8 string")),
            _ => Err(KvError::unexpected(command, "string")),
        }
    }

    fn into_f64(self, command: &'static str) -> Result<f64, KvError> {
        match self {
            Reply::Double(value) => Ok(value),
            Reply::Int(value) => Ok(value as f64),
            Reply::Data(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| text.parse::<f64>().ok())
                .ok_or_else(|| KvError::unexpected(command, "float")),
            _ => Err(KvError::unexpected(command, "float")),
        }
    }

    fn into_i64(self, command: &'static str) -> Result<i64, KvError> {
        match self {
            Reply::Int(value) => Ok(value),
            Reply::Data(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| text.parse::<i64>().ok())
                .ok_or_else(|| KvError::unexpected(command, "integer")),
            _ => Err(KvError::unexpected(command, "integer")),
        }
    }

    /// Scan cursors are unsigned 64-bit and arrive as bulk strings.
    fn into_cursor(self, command: &'static str) -> Result<u64, KvError> {
        match self {
            Reply::Int(value) => {
                u64::try_from(value).map_err(|_| KvError::unexpected(command, "unsigned cursor"))
            }
            Reply::Data(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| text.parse::<u64>().ok())
                .ok_or_else(|| KvError::unexpected(command, "unsigned cursor")),
            _ => Err(KvError::unexpected(command, "unsigned cursor")),
        }
    }
}

/// Conversion from a raw [`Reply`] into the type a [`Slot`] promises.
pub trait FromReply: Sized {
    fn from_reply(command: &'static str, reply: Reply) -> Result<Self, KvError>;
}

impl FromReply for () {
    fn from_reply(_command: &'static str, _reply: Reply) -> Result<Self, KvError> {
        Ok(())
    }
}

impl FromReply for i64 {
    fn from_reply(command: &'static str, reply: Reply) -> Result<Self, KvError> {
        reply.into_i64(command)
    }
}

impl FromReply for f64 {
    fn from_reply(command: &'static str, reply: Reply) -> Result<Self, KvError> {
        reply.into_f64(command)
    }
}

impl FromReply for bool {
    fn from_reply(command: &'static str, reply: Reply) -> Result<Self, KvError> {
        match reply {
            // Conditional SET answers OK or nil rather than an integer.
            Reply::Ok => Ok(true),
            Reply::Nil => Ok(false),
            other => Ok(other.into_i64(command)? != 0),
        }
    }
}

impl FromReply for Option<Bytes> {
    fn from_reply(command: &'static str, reply: Reply) -> Result<Self, KvError> {
        match reply {
            Reply::Nil => Ok(None),
            Reply::Data(bytes) => Ok(Some(bytes)),
            _ => Err(KvError::unexpected(command, "bulk string or nil")),
        }
    }
}

impl FromReply for Option<f64> {
    fn from_reply(command: &'static str, reply: Reply) -> Result<Self, KvError> {
        match reply {
            Reply::Nil => Ok(None),
            other => other.into_f64(command).map(Some),
        }
    }
}

impl FromReply for Vec<String> {
    fn from_reply(command: &'static str, reply: Reply) -> Result<Self, KvError> {
        match reply {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| item.into_string(command))
                .collect(),
            Reply::Nil => Ok(Vec::new()),
            _ => Err(KvError::unexpected(command, "array of strings")),
        }
    }
}

impl FromReply for Vec<(String, f64)> {
    fn from_reply(command: &'static str, reply: Reply) -> Result<Self, KvError> {
        let items = match reply {
            Reply::Array(items) => items,
            Reply::Nil => return Ok(Vec::new()),
            _ => return Err(KvError::unexpected(command, "member/score array")),
        };

        // RESP3 nests each pair, RESP2 flattens them.
        if items.iter().all(|item| matches!(item, Reply::Array(_))) {
            return items
                .into_iter()
                .map(|item| match item {
                    Reply::Array(pair) => pair_from(command, pair),
                    _ => Err(KvError::unexpected(command, "member/score pair")),
                })
                .collect();
        }

        if items.len() % 2 != 0 {
            return Err(KvError::unexpected(command, "even member/score array"));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(member), Some(score)) = (iter.next(), iter.next()) {
            pairs.push((member.into_string(command)?, score.into_f64(command)?));
        }
        Ok(pairs)
    }
}

fn pair_from(command: &'static str, pair: Vec<Reply>) -> Result<(String, f64), KvError> {
    let mut iter = pair.into_iter();
    match (iter.next(), iter.next(), iter.next()) {
        (Some(member), Some(score), None) => {
            Ok((member.into_string(command)?, score.into_f64(command)?))
        }
        _ => Err(KvError::unexpected(command, "member/score pair")),
    }
}

impl FromReply for HashMap<String, i64> {
    fn from_reply(command: &'static str, reply: Reply) -> Result<Self, KvError> {
        let items = match reply {
            Reply::Array(items) => items,
            Reply::Nil => return Ok(HashMap::new()),
            _ => return Err(KvError::unexpected(command, "field/value array")),
        };
        if items.len() % 2 != 0 {
            return Err(KvError::unexpected(command, "even field/value array"));
        }
        let mut map = HashMap::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            map.insert(field.into_string(command)?, value.into_i64(command)?);
        }
        Ok(map)
    }
}

/// One page of a sorted-set scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPage {
    pub cursor: u64,
    pub entries: Vec<(String, f64)>,
}

impl FromReply for ScanPage {
    fn from_reply(command: &'static str, reply: Reply) -> Result<Self, KvError> {
        let Reply::Array(items) = reply else {
            return Err(KvError::unexpected(command, "cursor/entries array"));
        };
        let mut iter = items.into_iter();
        match (iter.next(), iter.next(), iter.next()) {
            (Some(cursor), Some(entries), None) => {
                let cursor = cursor.into_cursor(command)?;
                let entries = Vec::<(String, f64)>::from_reply(command, entries)?;
                Ok(ScanPage { cursor, entries })
            }
            _ => Err(KvError::unexpected(command, "cursor/entries array")),
        }
    }
}

/// Typed handle to the reply of one queued command.
pub struct Slot<T> {
    index: usize,
    command: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slot<T> {}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("command", &self.command)
            .finish()
    }
}

/// Batch of commands sent in one round trip.
///
/// A plain pipeline gives no cross-command atomicity. [`Pipeline::atomic`]
/// asks the backend to execute the batch without interleaving other clients
/// (MULTI/EXEC on Redis). A command failing at runtime does not roll back the
/// others.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    commands: Vec<Command>,
    atomic: bool,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn atomic() -> Self {
        Self {
            commands: Vec::new(),
            atomic: true,
        }
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn push<T>(&mut self, command: Command) -> Slot<T> {
        let slot = Slot {
            index: self.commands.len(),
            command: command.name(),
            _marker: PhantomData,
        };
        self.commands.push(command);
        slot
    }

    pub fn get(&mut self, key: impl Into<String>) -> Slot<Option<Bytes>> {
        self.push(Command::Get { key: key.into() })
    }

    pub fn set_with_ttl(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Slot<()> {
        self.push(Command::SetEx {
            key: key.into(),
            value: value.into(),
            ttl,
        })
    }

    /// Store `value` only if `key` does not exist. The slot reads `true` when
    /// this call created the key.
    pub fn set_nx_with_ttl(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Slot<bool> {
        self.push(Command::SetNxEx {
            key: key.into(),
            value: value.into(),
            ttl,
        })
    }

    pub fn incr_by(&mut self, key: impl Into<String>, delta: i64) -> Slot<i64> {
        self.push(Command::IncrBy {
            key: key.into(),
            delta,
        })
    }

    pub fn del<I, K>(&mut self, keys: I) -> Slot<i64>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.push(Command::Del {
            keys: keys.into_iter().map(Into::into).collect(),
        })
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> Slot<bool> {
        self.push(Command::Expire {
            key: key.into(),
            ttl,
        })
    }

    pub fn set_add(&mut self, key: impl Into<String>, member: impl Into<String>) -> Slot<bool> {
        self.push(Command::SAdd {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn set_remove(&mut self, key: impl Into<String>, member: impl Into<String>) -> Slot<bool> {
        self.push(Command::SRem {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn set_members(&mut self, key: impl Into<String>) -> Slot<Vec<String>> {
        self.push(Command::SMembers { key: key.into() })
    }

    pub fn set_is_member(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
    ) -> Slot<bool> {
        self.push(Command::SIsMember {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn hash_set(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: i64,
    ) -> Slot<()> {
        self.push(Command::HSet {
            key: key.into(),
            field: field.into(),
            value,
        })
    }

    pub fn hash_incr_by(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        delta: i64,
    ) -> Slot<i64> {
        self.push(Command::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
        })
    }

    pub fn hash_get_all(&mut self, key: impl Into<String>) -> Slot<HashMap<String, i64>> {
        self.push(Command::HGetAll { key: key.into() })
    }

    pub fn hash_del(&mut self, key: impl Into<String>, field: impl Into<String>) -> Slot<bool> {
        self.push(Command::HDel {
            key: key.into(),
            field: field.into(),
        })
    }

    pub fn zset_add(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        score: f64,
    ) -> Slot<()> {
        self.push(Command::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        })
    }

    pub fn zset_incr_by(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        delta: f64,
    ) -> Slot<f64> {
        self.push(Command::ZIncrBy {
            key: key.into(),
            member: member.into(),
            delta,
        })
    }

    pub fn zset_range(
        &mut self,
        key: impl Into<String>,
        start: isize,
        stop: isize,
        order: Order,
    ) -> Slot<Vec<(String, f64)>> {
        self.push(Command::ZRange {
            key: key.into(),
            start,
            stop,
            order,
        })
    }

    pub fn zset_remove_range_by_rank(
        &mut self,
        key: impl Into<String>,
        start: isize,
        stop: isize,
    ) -> Slot<i64> {
        self.push(Command::ZRemRangeByRank {
            key: key.into(),
            start,
            stop,
        })
    }

    pub fn zset_scan_page(
        &mut self,
        key: impl Into<String>,
        cursor: u64,
        count: usize,
    ) -> Slot<ScanPage> {
        self.push(Command::ZScan {
            key: key.into(),
            cursor,
            count,
        })
    }

    pub fn zset_score(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
    ) -> Slot<Option<f64>> {
        self.push(Command::ZScore {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn zset_remove(&mut self, key: impl Into<String>, member: impl Into<String>) -> Slot<bool> {
        self.push(Command::ZRem {
            key: key.into(),
            member: member.into(),
        })
    }
}

/// Replies of an executed pipeline, in command order.
#[derive(Debug, Default)]
pub struct Replies {
    replies: Vec<Option<Reply>>,
}

impl Replies {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: replies.into_iter().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    /// Move the reply for `slot` out, converted to the slot's type.
    pub fn take<T: FromReply>(&mut self, slot: Slot<T>) -> Result<T, KvError> {
        let reply = self
            .replies
            .get_mut(slot.index)
            .and_then(Option::take)
            .ok_or(KvError::MissingReply { index: slot.index })?;
        T::from_reply(slot.command, reply)
    }
}

/// A key-value store able to run command pipelines.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn execute(&self, pipeline: Pipeline) -> Result<Replies, KvError>;
}

/// Single-command conveniences over [`KvStore::execute`].
#[async_trait]
pub trait KvExt: KvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        let mut pipeline = Pipeline::new();
        let slot = pipeline.get(key);
        self.execute(pipeline).await?.take(slot)
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), KvError> {
        let mut pipeline = Pipeline::new();
        let slot = pipeline.set_with_ttl(key, value, ttl);
        self.execute(pipeline).await?.take(slot)
    }

    async fn set_nx_with_ttl(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut pipeline = Pipeline::new();
        let slot = pipeline.set_nx_with_ttl(key, value, ttl);
        self.execute(pipeline).await?.take(slot)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let mut pipeline = Pipeline::new();
        let slot = pipeline.incr_by(key, delta);
        self.execute(pipeline).await?.take(slot)
    }

    async fn del(&self, keys: Vec<String>) -> Result<i64, KvError> {
        let mut pipeline = Pipeline::new();
        let slot = pipeline.del(keys);
        self.execute(pipeline).await?.take(slot)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut pipeline = Pipeline::new();
        let slot = pipeline.set_members(key);
        self.execute(pipeline).await?.take(slot)
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut pipeline = Pipeline::new();
        let slot = pipeline.set_is_member(key, member);
        self.execute(pipeline).await?.take(slot)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, i64>, KvError> {
        let mut pipeline = Pipeline::new();
        let slot = pipeline.hash_get_all(key);
        self.execute(pipeline).await?.take(slot)
    }

    async fn zset_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        order: Order,
    ) -> Result<Vec<(String, f64)>, KvError> {
        let mut pipeline = Pipeline::new();
        let slot = pipeline.zset_range(key, start, stop, order);
        self.execute(pipeline).await?.take(slot)
    }

    async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>, KvError> {
        let mut pipeline = Pipeline::new();
        let slot = pipeline.zset_score(key, member);
        self.execute(pipeline).await?.take(slot)
    }

    /// Walk a whole sorted set with cursor pages. Members may repeat across
    /// pages while the set is being modified; the last score seen wins.
    async fn zset_scan(&self, key: &str, page_size: usize) -> Result<Vec<(String, f64)>, KvError> {
        let mut seen: HashMap<String, f64> = HashMap::new();
        let mut cursor = 0;
        loop {
            let mut pipeline = Pipeline::new();
            let slot = pipeline.zset_scan_page(key, cursor, page_size.max(1));
            let page = self.execute(pipeline).await?.take(slot)?;
            seen.extend(page.entries);
            if page.cursor == 0 {
                break;
            }
            cursor = page.cursor;
        }
        Ok(seen.into_iter().collect())
    }
}

impl<T: KvStore + ?Sized> KvExt for T {}

/// Log and count a failed store call. Callers fall back to a safe default
/// afterwards; the cache never fails a request on its own.
pub(crate) fn report_kv_error(op: &'static str, key: &str, err: &KvError) {
    counter!(METRIC_KV_ERROR_TOTAL, "op" => op).increment(1);
    warn!(op, key, error = %err, "kv operation failed, serving fallback");
}
