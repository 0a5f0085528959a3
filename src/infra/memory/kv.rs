//! In-process key-value store with Redis command semantics.
//!
//! All state sits behind one mutex, so every pipeline runs as if the server
//! were single threaded. Expiry is evaluated lazily against the injected
//! [`Clock`], which lets tests step over TTL boundaries without sleeping.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tracing::warn;

use crate::cache::{
    Clock, SystemClock,
    kv::{Command, KvError, KvStore, Order, Pipeline, Replies, Reply, ttl_seconds},
};

#[derive(Debug, Clone)]
enum Value {
    Text(Bytes),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, i64>),
    Sorted(HashMap<String, f64>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "string",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
            Value::Sorted(_) => "zset",
        }
    }

    fn is_empty_container(&self) -> bool {
        match self {
            Value::Text(_) => false,
            Value::Set(set) => set.is_empty(),
            Value::Hash(hash) => hash.is_empty(),
            Value::Sorted(zset) => zset.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<OffsetDateTime>,
}

impl Entry {
    fn persistent(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    entries: HashMap<String, Entry>,
}

pub struct MemoryKv {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    round_trips: AtomicUsize,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            unavailable: AtomicBool::new(false),
            round_trips: AtomicUsize::new(0),
        }
    }

    /// Simulate an outage: every pipeline fails with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of non-empty pipelines executed so far.
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Remaining lifetime of `key`; `None` when absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut state = self.lock_state("ttl");
        state.purge(key, now);
        let expires_at = state.entries.get(key)?.expires_at?;
        Duration::try_from(expires_at - now).ok()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.lock_state("contains_key");
        state.purge(key, now);
        state.entries.contains_key(key)
    }

    /// Drop every key, as FLUSHDB would.
    pub fn flush(&self) {
        self.lock_state("flush").entries.clear();
    }

    fn lock_state(&self, op: &'static str) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    op,
                    lock_kind = "mutex.lock",
                    result = "poisoned_recovered",
                    "Recovered from poisoned in-memory kv lock"
                );
                poisoned.into_inner()
            }
        }
    }

    /// Run every command in order under one lock. Like Redis, a command that
    /// fails at runtime does not undo the others; the first failure is
    /// returned once the whole batch has been applied.
    fn run(&self, pipeline: Pipeline) -> Result<Vec<Reply>, KvError> {
        let now = self.clock.now();
        let mut state = self.lock_state("execute");
        state.apply_all(pipeline.into_commands(), now)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn execute(&self, pipeline: Pipeline) -> Result<Replies, KvError> {
        if pipeline.is_empty() {
            return Ok(Replies::default());
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KvError::connection("in-memory store is marked unavailable"));
        }
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.run(pipeline).map(Replies::new)
    }
}

impl State {
    fn apply_all(
        &mut self,
        commands: Vec<Command>,
        now: OffsetDateTime,
    ) -> Result<Vec<Reply>, KvError> {
        let mut replies = Vec::with_capacity(commands.len());
        let mut first_error = None;
        for command in commands {
            match self.apply(command, now) {
                Ok(reply) => replies.push(reply),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(replies),
        }
    }

    fn purge(&mut self, key: &str, now: OffsetDateTime) {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str, now: OffsetDateTime) -> Option<&mut Entry> {
        self.purge(key, now);
        self.entries.get_mut(key)
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.value.is_empty_container())
        {
            self.entries.remove(key);
        }
    }

    fn set_mut(&mut self, key: &str, now: OffsetDateTime) -> Result<&mut BTreeSet<String>, KvError> {
        self.purge(key, now);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::persistent(Value::Set(BTreeSet::new())));
        match &mut entry.value {
            Value::Set(set) => Ok(set),
            other => Err(wrong_type(key, other)),
        }
    }

    fn hash_mut(
        &mut self,
        key: &str,
        now: OffsetDateTime,
    ) -> Result<&mut BTreeMap<String, i64>, KvError> {
        self.purge(key, now);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::persistent(Value::Hash(BTreeMap::new())));
        match &mut entry.value {
            Value::Hash(hash) => Ok(hash),
            other => Err(wrong_type(key, other)),
        }
    }

    fn zset_mut(
        &mut self,
        key: &str,
        now: OffsetDateTime,
    ) -> Result<&mut HashMap<String, f64>, KvError> {
        self.purge(key, now);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::persistent(Value::Sorted(HashMap::new())));
        match &mut entry.value {
            Value::Sorted(zset) => Ok(zset),
            other => Err(wrong_type(key, other)),
        }
    }

    /// Sorted-set members in ascending (score, member) order; empty when absent.
    fn ranked(&mut self, key: &str, now: OffsetDateTime) -> Result<Vec<(String, f64)>, KvError> {
        let Some(entry) = self.live(key, now) else {
            return Ok(Vec::new());
        };
        let Value::Sorted(zset) = &entry.value else {
            return Err(wrong_type(key, &entry.value));
        };
        let mut ranked: Vec<(String, f64)> = zset
            .iter()
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        ranked.sort_by(ascending);
        Ok(ranked)
    }

    fn apply(&mut self, command: Command, now: OffsetDateTime) -> Result<Reply, KvError> {
        match command {
            Command::Get { key } => match self.live(&key, now) {
                None => Ok(Reply::Nil),
                Some(Entry {
                    value: Value::Text(bytes),
                    ..
                }) => Ok(Reply::Data(bytes.clone())),
                Some(entry) => Err(wrong_type(&key, &entry.value)),
            },
            Command::SetEx { key, value, ttl } => {
                let expires_at = now + Duration::from_secs(ttl_seconds(ttl));
                self.entries.insert(
                    key,
                    Entry {
                        value: Value::Text(value),
                        expires_at: Some(expires_at),
                    },
                );
                Ok(Reply::Ok)
            }
            Command::SetNxEx { key, value, ttl } => {
                if self.live(&key, now).is_some() {
                    return Ok(Reply::Nil);
                }
                let expires_at = now + Duration::from_secs(ttl_seconds(ttl));
                self.entries.insert(
                    key,
                    Entry {
                        value: Value::Text(value),
                        expires_at: Some(expires_at),
                    },
                );
                Ok(Reply::Ok)
            }
            Command::IncrBy { key, delta } => {
                let Some(entry) = self.live(&key, now) else {
                    self.entries.insert(
                        key,
                        Entry::persistent(Value::Text(Bytes::from(delta.to_string()))),
                    );
                    return Ok(Reply::Int(delta));
                };
                let Value::Text(bytes) = &entry.value else {
                    return Err(wrong_type(&key, &entry.value));
                };
                let current: i64 = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|text| text.parse().ok())
                    .ok_or_else(|| {
                        KvError::command("ERR value is not an integer or out of range")
                    })?;
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| KvError::command("ERR increment or decrement would overflow"))?;
                entry.value = Value::Text(Bytes::from(next.to_string()));
                Ok(Reply::Int(next))
            }
            Command::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    self.purge(&key, now);
                    if self.entries.remove(&key).is_some() {
                        removed += 1;
                    }
                }
                Ok(Reply::Int(removed))
            }
            Command::Expire { key, ttl } => match self.live(&key, now) {
                Some(entry) => {
                    entry.expires_at = Some(now + Duration::from_secs(ttl_seconds(ttl)));
                    Ok(Reply::Int(1))
                }
                None => Ok(Reply::Int(0)),
            },
            Command::SAdd { key, member } => {
                let added = self.set_mut(&key, now)?.insert(member);
                Ok(Reply::Int(i64::from(added)))
            }
            Command::SRem { key, member } => {
                let removed = match self.live(&key, now) {
                    None => false,
                    Some(Entry {
                        value: Value::Set(set),
                        ..
                    }) => set.remove(&member),
                    Some(entry) => return Err(wrong_type(&key, &entry.value)),
                };
                self.drop_if_empty(&key);
                Ok(Reply::Int(i64::from(removed)))
            }
            Command::SMembers { key } => match self.live(&key, now) {
                None => Ok(Reply::Array(Vec::new())),
                Some(Entry {
                    value: Value::Set(set),
                    ..
                }) => Ok(Reply::Array(set.iter().map(|m| text(m)).collect())),
                Some(entry) => Err(wrong_type(&key, &entry.value)),
            },
            Command::SIsMember { key, member } => match self.live(&key, now) {
                None => Ok(Reply::Int(0)),
                Some(Entry {
                    value: Value::Set(set),
                    ..
                }) => Ok(Reply::Int(i64::from(set.contains(&member)))),
                Some(entry) => Err(wrong_type(&key, &entry.value)),
            },
            Command::HSet { key, field, value } => {
                let created = self.hash_mut(&key, now)?.insert(field, value).is_none();
                Ok(Reply::Int(i64::from(created)))
            }
            Command::HIncrBy { key, field, delta } => {
                let slot = self.hash_mut(&key, now)?.entry(field).or_insert(0);
                *slot = slot
                    .checked_add(delta)
                    .ok_or_else(|| KvError::command("ERR increment or decrement would overflow"))?;
                Ok(Reply::Int(*slot))
            }
            Command::HGetAll { key } => match self.live(&key, now) {
                None => Ok(Reply::Array(Vec::new())),
                Some(Entry {
                    value: Value::Hash(hash),
                    ..
                }) => Ok(Reply::Array(
                    hash.iter()
                        .flat_map(|(field, value)| [text(field), text(&value.to_string())])
                        .collect(),
                )),
                Some(entry) => Err(wrong_type(&key, &entry.value)),
            },
            Command::HDel { key, field } => {
                let removed = match self.live(&key, now) {
                    None => false,
                    Some(Entry {
                        value: Value::Hash(hash),
                        ..
                    }) => hash.remove(&field).is_some(),
                    Some(entry) => return Err(wrong_type(&key, &entry.value)),
                };
                self.drop_if_empty(&key);
                Ok(Reply::Int(i64::from(removed)))
            }
            Command::ZAdd { key, member, score } => {
                let created = self.zset_mut(&key, now)?.insert(member, score).is_none();
                Ok(Reply::Int(i64::from(created)))
            }
            Command::ZIncrBy { key, member, delta } => {
                let score = self.zset_mut(&key, now)?.entry(member).or_insert(0.0);
                *score += delta;
                Ok(Reply::Data(Bytes::from(score.to_string())))
            }
            Command::ZRange {
                key,
                start,
                stop,
                order,
            } => {
                let mut ranked = self.ranked(&key, now)?;
                if order == Order::Desc {
                    ranked.reverse();
                }
                let Some((first, last)) = rank_bounds(start, stop, ranked.len()) else {
                    return Ok(Reply::Array(Vec::new()));
                };
                Ok(Reply::Array(flatten_scored(&ranked[first..=last])))
            }
            Command::ZRemRangeByRank { key, start, stop } => {
                let ranked = self.ranked(&key, now)?;
                let Some((first, last)) = rank_bounds(start, stop, ranked.len()) else {
                    return Ok(Reply::Int(0));
                };
                let zset = self.zset_mut(&key, now)?;
                for (member, _) in &ranked[first..=last] {
                    zset.remove(member);
                }
                self.drop_if_empty(&key);
                let removed = i64::try_from(last - first + 1).unwrap_or(i64::MAX);
                Ok(Reply::Int(removed))
            }
            Command::ZScan { key, cursor, count } => {
                let mut by_member = self.ranked(&key, now)?;
                by_member.sort_by(|a, b| a.0.cmp(&b.0));
                let offset = usize::try_from(cursor).unwrap_or(usize::MAX);
                let end = offset.saturating_add(count.max(1)).min(by_member.len());
                let page = by_member.get(offset..end).unwrap_or_default();
                let next = if end >= by_member.len() {
                    0
                } else {
                    u64::try_from(end).unwrap_or(0)
                };
                Ok(Reply::Array(vec![
                    text(&next.to_string()),
                    Reply::Array(flatten_scored(page)),
                ]))
            }
            Command::ZScore { key, member } => match self.live(&key, now) {
                None => Ok(Reply::Nil),
                Some(Entry {
                    value: Value::Sorted(zset),
                    ..
                }) => Ok(zset
                    .get(&member)
                    .map(|score| text(&score.to_string()))
                    .unwrap_or(Reply::Nil)),
                Some(entry) => Err(wrong_type(&key, &entry.value)),
            },
            Command::ZRem { key, member } => {
                let removed = match self.live(&key, now) {
                    None => false,
                    Some(Entry {
                        value: Value::Sorted(zset),
                        ..
                    }) => zset.remove(&member).is_some(),
                    Some(entry) => return Err(wrong_type(&key, &entry.value)),
                };
                self.drop_if_empty(&key);
                Ok(Reply::Int(i64::from(removed)))
            }
        }
    }
}

fn wrong_type(key: &str, value: &Value) -> KvError {
    KvError::command(format!(
        "WRONGTYPE operation against key `{key}` holding a {}",
        value.type_name()
    ))
}

fn text(value: &str) -> Reply {
    Reply::Data(Bytes::copy_from_slice(value.as_bytes()))
}

fn ascending(a: &(String, f64), b: &(String, f64)) -> CmpOrdering {
    a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0))
}

fn flatten_scored(entries: &[(String, f64)]) -> Vec<Reply> {
    entries
        .iter()
        .flat_map(|(member, score)| [text(member), text(&score.to_string())])
        .collect()
}

/// Resolve inclusive, possibly negative rank indices the way Redis does.
fn rank_bounds(start: isize, stop: isize, len: usize) -> Option<(usize, usize)> {
    let len = isize::try_from(len).ok()?;
    let start = if start < 0 { (start + len).max(0) } else { start };
    let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::cache::{ManualClock, kv::KvExt};

    fn store() -> (Arc<ManualClock>, MemoryKv) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-06-01 00:00 UTC)));
        let kv = MemoryKv::with_clock(clock.clone());
        (clock, kv)
    }

    #[tokio::test]
    async fn values_expire_with_the_clock() {
        let (clock, kv) = store();
        kv.set_with_ttl("k", Bytes::from_static(b"v"), Duration::from_secs(10))
            .await
            .expect("set");

        clock.advance(Duration::from_secs(9));
        assert!(kv.get("k").await.expect("get").is_some());

        clock.advance(Duration::from_secs(1));
        assert!(kv.get("k").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn incr_keeps_the_existing_expiry() {
        let (_clock, kv) = store();
        let mut pipeline = Pipeline::new();
        pipeline.incr_by("views:p", 1);
        pipeline.expire("views:p", Duration::from_secs(60));
        kv.execute(pipeline).await.expect("pipeline");

        assert_eq!(kv.incr_by("views:p", 1).await.expect("incr"), 2);
        assert_eq!(kv.ttl("views:p"), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn type_mismatch_is_a_command_error() {
        let (_clock, kv) = store();
        let mut pipeline = Pipeline::new();
        pipeline.set_add("s", "x");
        kv.execute(pipeline).await.expect("sadd");

        assert!(matches!(
            kv.incr_by("s", 1).await,
            Err(KvError::Command(message)) if message.contains("WRONGTYPE")
        ));
    }

    #[tokio::test]
    async fn failing_command_does_not_undo_the_rest() {
        let (_clock, kv) = store();
        let mut seed = Pipeline::new();
        seed.set_add("s", "x");
        kv.execute(seed).await.expect("seed");

        let mut pipeline = Pipeline::atomic();
        pipeline.incr_by("counter", 5);
        pipeline.incr_by("s", 1);
        pipeline.set_add("s", "y");
        assert!(matches!(
            kv.execute(pipeline).await,
            Err(KvError::Command(_))
        ));

        assert_eq!(kv.incr_by("counter", 0).await.expect("counter"), 5);
        assert!(kv.set_is_member("s", "y").await.expect("member"));
    }

    #[tokio::test]
    async fn conditional_set_only_creates_missing_keys() {
        let (clock, kv) = store();
        let ttl = Duration::from_secs(30);

        let claim =
            |value: &'static [u8]| kv.set_nx_with_ttl("lock", Bytes::from_static(value), ttl);

        assert!(claim(b"a").await.expect("first"));
        assert!(!claim(b"b").await.expect("second"));
        assert_eq!(kv.get("lock").await.expect("get").as_deref(), Some(&b"a"[..]));

        clock.advance(Duration::from_secs(31));
        assert!(claim(b"c").await.expect("after expiry"));
    }

    #[tokio::test]
    async fn ranges_follow_redis_rank_rules() {
        let (_clock, kv) = store();
        let mut pipeline = Pipeline::new();
        for (member, score) in [("a", 1.0), ("b", 3.0), ("c", 2.0), ("d", 3.0)] {
            pipeline.zset_add("z", member, score);
        }
        kv.execute(pipeline).await.expect("zadd");

        let desc = kv.zset_range("z", 0, 1, Order::Desc).await.expect("range");
        assert_eq!(desc, vec![("d".to_string(), 3.0), ("b".to_string(), 3.0)]);

        let mut trim = Pipeline::new();
        let removed = trim.zset_remove_range_by_rank("z", 0, -3);
        assert_eq!(kv.execute(trim).await.expect("trim").take(removed).expect("count"), 2);

        let remaining = kv.zset_range("z", 0, -1, Order::Asc).await.expect("range");
        assert_eq!(remaining, vec![("b".to_string(), 3.0), ("d".to_string(), 3.0)]);
    }

    #[tokio::test]
    async fn scan_walks_every_page() {
        let (_clock, kv) = store();
        let mut pipeline = Pipeline::new();
        for index in 0..7 {
            pipeline.zset_add("z", format!("m{index}"), f64::from(index));
        }
        kv.execute(pipeline).await.expect("zadd");

        let before = kv.round_trips();
        let mut all = kv.zset_scan("z", 3).await.expect("scan");
        all.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(all.len(), 7);
        assert_eq!(kv.round_trips() - before, 3);
    }

    #[tokio::test]
    async fn emptied_containers_disappear() {
        let (_clock, kv) = store();
        let mut pipeline = Pipeline::new();
        pipeline.set_add("s", "x");
        pipeline.set_remove("s", "x");
        kv.execute(pipeline).await.expect("pipeline");
        assert!(!kv.contains_key("s"));
    }

    #[tokio::test]
    async fn outage_fails_every_pipeline() {
        let (_clock, kv) = store();
        kv.set_unavailable(true);
        assert!(matches!(kv.get("k").await, Err(KvError::Connection(_))));
        kv.set_unavailable(false);
        assert!(kv.get("k").await.expect("get").is_none());
    }

    #[test]
    fn rank_bounds_clamp_like_redis() {
        assert_eq!(rank_bounds(0, -1, 3), Some((0, 2)));
        assert_eq!(rank_bounds(-10, 10, 3), Some((0, 2)));
        assert_eq!(rank_bounds(2, 1, 3), None);
        assert_eq!(rank_bounds(0, -1, 0), None);
        assert_eq!(rank_bounds(0, -101, 50), None);
    }
}
