//! In-process [`Store`] with the same semantics as [`super::RedisStore`].
//!
//! Keys expire lazily on access, empty hashes/lists/sets disappear like they
//! do in Redis, transactions are staged on a copy and swapped in whole, and
//! every script is emulated against the same `KEYS`/`ARGV` positions as its
//! Lua source.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time::Instant;

use super::scripts::{priority_score, reason};
use super::{ScriptCall, ScriptName, ScriptReply, Store, StoreError, StoreResult, Transaction, TxOp};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    ZSet(Vec<(f64, String)>),
    Set(HashSet<String>),
}

impl Entry {
    fn is_empty(&self) -> bool {
        match self {
            Entry::Str(_) => false,
            Entry::Hash(h) => h.is_empty(),
            Entry::List(l) => l.is_empty(),
            Entry::ZSet(z) => z.is_empty(),
            Entry::Set(s) => s.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

/// Redis-style `[start, stop]` bounds with negative indices counted from the end.
fn range_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType(key.to_string())
}

#[derive(Debug, Clone, Default)]
struct Data {
    slots: HashMap<String, Slot>,
}

impl Data {
    fn purge(&mut self, key: &str) {
        let expired = self
            .slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.slots.remove(key);
        }
    }

    fn read(&mut self, key: &str) -> Option<&Entry> {
        self.purge(key);
        self.slots.get(key).map(|slot| &slot.entry)
    }

    fn entry_mut(&mut self, key: &str, make: fn() -> Entry) -> &mut Entry {
        self.purge(key);
        &mut self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot {
                entry: make(),
                expires_at: None,
            })
            .entry
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.slots.get(key).is_some_and(|slot| slot.entry.is_empty()) {
            self.slots.remove(key);
        }
    }

    // --- strings ---

    fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        match self.read(key) {
            None => Ok(None),
            Some(Entry::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn incr(&mut self, key: &str) -> StoreResult<i64> {
        match self.entry_mut(key, || Entry::Str("0".to_string())) {
            Entry::Str(s) => {
                let next = s
                    .parse::<i64>()
                    .map_err(|_| StoreError::RedisError("ERR value is not an integer".into()))?
                    + 1;
                *s = next.to_string();
                Ok(next)
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn pexpire(&mut self, key: &str, ttl_ms: u64) {
        self.purge(key);
        if let Some(slot) = self.slots.get_mut(key) {
            slot.expires_at = Some(Instant::now() + Duration::from_millis(ttl_ms));
        }
    }

    fn del(&mut self, key: &str) -> bool {
        self.purge(key);
        self.slots.remove(key).is_some()
    }

    // --- hashes ---

    fn hash(&mut self, key: &str) -> StoreResult<Option<&HashMap<String, String>>> {
        match self.read(key) {
            None => Ok(None),
            Some(Entry::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hget(&mut self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        match self.entry_mut(key, || Entry::Hash(HashMap::new())) {
            Entry::Hash(h) => {
                h.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn hdel(&mut self, key: &str, field: &str) -> StoreResult<()> {
        if self.hash(key)?.is_none() {
            return Ok(());
        }
        if let Entry::Hash(h) = self.entry_mut(key, || Entry::Hash(HashMap::new())) {
            h.remove(field);
        }
        self.drop_if_empty(key);
        Ok(())
    }

    // --- lists ---

    fn list(&mut self, key: &str) -> StoreResult<Option<&VecDeque<String>>> {
        match self.read(key) {
            None => Ok(None),
            Some(Entry::List(l)) => Ok(Some(l)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list_mut(&mut self, key: &str) -> StoreResult<&mut VecDeque<String>> {
        match self.entry_mut(key, || Entry::List(VecDeque::new())) {
            Entry::List(l) => Ok(l),
            _ => Err(wrong_type(key)),
        }
    }

    fn lpush(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.list_mut(key)?.push_front(value.to_string());
        Ok(())
    }

    fn rpush(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.list_mut(key)?.push_back(value.to_string());
        Ok(())
    }

    fn lrem(&mut self, key: &str, value: &str) -> StoreResult<usize> {
        if self.list(key)?.is_none() {
            return Ok(0);
        }
        let list = self.list_mut(key)?;
        let before = list.len();
        list.retain(|item| item != value);
        let removed = before - list.len();
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn ltrim(&mut self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        if self.list(key)?.is_none() {
            return Ok(());
        }
        let list = self.list_mut(key)?;
        match range_bounds(list.len(), start, stop) {
            Some((from, to)) => {
                list.truncate(to + 1);
                list.drain(..from);
            }
            None => list.clear(),
        }
        self.drop_if_empty(key);
        Ok(())
    }

    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let Some(list) = self.list(key)? else {
            return Ok(Vec::new());
        };
        Ok(match range_bounds(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    fn rpoplpush(&mut self, source: &str, destination: &str) -> StoreResult<Option<String>> {
        if self.list(source)?.is_none() {
            return Ok(None);
        }
        // Check the destination type before mutating the source.
        self.list(destination)?;
        let item = self.list_mut(source)?.pop_back();
        self.drop_if_empty(source);
        if let Some(item) = &item {
            self.lpush(destination, item)?;
        }
        Ok(item)
    }

    // --- sorted sets ---

    fn zset(&mut self, key: &str) -> StoreResult<Option<&Vec<(f64, String)>>> {
        match self.read(key) {
            None => Ok(None),
            Some(Entry::ZSet(z)) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn zadd(&mut self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        let zset = match self.entry_mut(key, || Entry::ZSet(Vec::new())) {
            Entry::ZSet(z) => z,
            _ => return Err(wrong_type(key)),
        };
        zset.retain(|(_, m)| m != member);
        let at = zset
            .iter()
            .position(|(s, m)| (*s, m.as_str()) > (score, member))
            .unwrap_or(zset.len());
        zset.insert(at, (score, member.to_string()));
        Ok(())
    }

    fn zrem(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        if self.zset(key)?.is_none() {
            return Ok(false);
        }
        let removed = match self.entry_mut(key, || Entry::ZSet(Vec::new())) {
            Entry::ZSet(z) => {
                let before = z.len();
                z.retain(|(_, m)| m != member);
                before != z.len()
            }
            _ => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    // --- sets ---

    fn set(&mut self, key: &str) -> StoreResult<Option<&HashSet<String>>> {
        match self.read(key) {
            None => Ok(None),
            Some(Entry::Set(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sadd(&mut self, key: &str, member: &str) -> StoreResult<()> {
        match self.entry_mut(key, || Entry::Set(HashSet::new())) {
            Entry::Set(s) => {
                s.insert(member.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn srem(&mut self, key: &str, member: &str) -> StoreResult<()> {
        if self.set(key)?.is_none() {
            return Ok(());
        }
        if let Entry::Set(s) = self.entry_mut(key, || Entry::Set(HashSet::new())) {
            s.remove(member);
        }
        self.drop_if_empty(key);
        Ok(())
    }

    fn sismember(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.set(key)?.is_some_and(|s| s.contains(member)))
    }

    // --- transactions ---

    fn apply(&mut self, op: &TxOp) -> StoreResult<()> {
        match op {
            TxOp::Del { key } => {
                self.del(key);
            }
            TxOp::HSet { key, field, value } => self.hset(key, field, value)?,
            TxOp::HDel { key, field } => self.hdel(key, field)?,
            TxOp::LPush { key, value } => self.lpush(key, value)?,
            TxOp::LRem { key, value } => {
                self.lrem(key, value)?;
            }
            TxOp::LTrim { key, start, stop } => self.ltrim(key, *start, *stop)?,
            TxOp::PExpire { key, ttl_ms } => self.pexpire(key, *ttl_ms),
            TxOp::ZAdd { key, score, member } => self.zadd(key, *score, member)?,
            TxOp::ZRem { key, member } => {
                self.zrem(key, member)?;
            }
            TxOp::SAdd { key, member } => self.sadd(key, member)?,
            TxOp::SRem { key, member } => self.srem(key, member)?,
        }
        Ok(())
    }

    // --- scripts ---

    fn push_pending(
        &mut self,
        queue_type: &str,
        pending: &str,
        priority_pending: &str,
        sequence: &str,
        priority: &str,
        id: &str,
    ) -> StoreResult<()> {
        match queue_type {
            "priority" => {
                let priority: u8 = priority.parse().map_err(|_| {
                    StoreError::RedisError(format!("ERR invalid priority '{priority}'"))
                })?;
                let seq = self.incr(sequence)?;
                self.zadd(priority_pending, priority_score(priority, seq as u64), id)
            }
            "lifo" => self.rpush(pending, id),
            _ => self.lpush(pending, id),
        }
    }

    fn store_message(&mut self, key: &str, data: &str, status: &str) -> StoreResult<()> {
        self.hset(key, "data", data)?;
        self.hset(key, "status", status)
    }

    /// Delivery-model checks shared by publish and schedule.
    fn check_group(
        &mut self,
        properties: &str,
        groups: &str,
        group: &str,
    ) -> StoreResult<Option<&'static str>> {
        if self.hget(properties, "delivery")?.as_deref() == Some("pub_sub") {
            if group.is_empty() {
                return Ok(Some(reason::CONSUMER_GROUP_REQUIRED));
            }
            if !self.sismember(groups, group)? {
                return Ok(Some(reason::CONSUMER_GROUP_NOT_FOUND));
            }
        }
        Ok(None)
    }

    fn run_script(&mut self, call: &ScriptCall) -> StoreResult<ScriptReply> {
        let k = |i| call.key_at(i);
        let a = |i| call.arg_at(i);
        let fail = |r: &str| -> StoreResult<ScriptReply> { Ok(ScriptReply::Text(r.to_string())) };

        match call.name {
            ScriptName::Publish => {
                let Some(queue_type) = self.hget(k(0), "type")? else {
                    return fail(reason::QUEUE_NOT_FOUND);
                };
                if let Some(r) = self.check_group(k(0), k(4), a(3))? {
                    return fail(r);
                }
                if queue_type == "priority" && a(2).is_empty() {
                    return fail(reason::MESSAGE_PRIORITY_REQUIRED);
                }
                if queue_type != "priority" && !a(2).is_empty() {
                    return fail(reason::PRIORITY_QUEUING_NOT_ENABLED);
                }
                self.push_pending(&queue_type, k(1), k(2), k(5), a(2), a(0))?;
                self.store_message(k(3), a(1), "PENDING")?;
                Ok(ScriptReply::Ok)
            }
            ScriptName::Schedule => {
                let Some(queue_type) = self.hget(k(0), "type")? else {
                    return fail(reason::QUEUE_NOT_FOUND);
                };
                if let Some(r) = self.check_group(k(0), k(3), a(4))? {
                    return fail(r);
                }
                if queue_type == "priority" && a(3).is_empty() {
                    return fail(reason::MESSAGE_PRIORITY_REQUIRED);
                }
                if queue_type != "priority" && !a(3).is_empty() {
                    return fail(reason::PRIORITY_QUEUING_NOT_ENABLED);
                }
                let fire_at: f64 = a(2)
                    .parse()
                    .map_err(|_| StoreError::RedisError("ERR invalid score".into()))?;
                self.zadd(k(1), fire_at, a(0))?;
                self.store_message(k(2), a(1), "SCHEDULED")?;
                Ok(ScriptReply::Ok)
            }
            ScriptName::PopPriority => {
                let Some(id) = self.zset(k(0))?.and_then(|z| z.first().map(|(_, m)| m.clone()))
                else {
                    return Ok(ScriptReply::Nil);
                };
                self.zrem(k(0), &id)?;
                self.lpush(k(1), &id)?;
                self.hset(&format!("{}{}", a(0), id), "status", "PROCESSING")?;
                Ok(ScriptReply::Text(id))
            }
            ScriptName::Requeue => {
                let Some(queue_type) = self.hget(k(0), "type")? else {
                    return fail(reason::QUEUE_NOT_FOUND);
                };
                if self.lrem(k(1), a(0))? == 0 {
                    return fail(reason::MESSAGE_NOT_PROCESSING);
                }
                self.push_pending(&queue_type, k(2), k(3), k(5), a(2), a(0))?;
                self.store_message(k(4), a(1), "PENDING")?;
                Ok(ScriptReply::Ok)
            }
            ScriptName::Delay => {
                if self.read(k(0)).is_none() {
                    return fail(reason::QUEUE_NOT_FOUND);
                }
                if self.lrem(k(1), a(0))? == 0 {
                    return fail(reason::MESSAGE_NOT_PROCESSING);
                }
                let due_at: f64 = a(2)
                    .parse()
                    .map_err(|_| StoreError::RedisError("ERR invalid score".into()))?;
                self.zadd(k(2), due_at, a(0))?;
                self.store_message(k(3), a(1), "DELAYED")?;
                Ok(ScriptReply::Ok)
            }
            ScriptName::Settle => {
                if self.lrem(k(0), a(0))? == 0 {
                    return fail(reason::MESSAGE_NOT_PROCESSING);
                }
                self.del(k(1));
                if !a(1).is_empty() {
                    self.lpush(k(2), a(1))?;
                    let size: i64 = a(2).parse().unwrap_or(0);
                    if size > 0 {
                        self.ltrim(k(2), 0, size - 1)?;
                    }
                    let expire: u64 = a(3).parse().unwrap_or(0);
                    if expire > 0 {
                        self.pexpire(k(2), expire);
                    }
                }
                Ok(ScriptReply::Ok)
            }
            ScriptName::Activate => {
                let Some(queue_type) = self.hget(k(0), "type")? else {
                    return fail(reason::QUEUE_NOT_FOUND);
                };
                if !self.zrem(k(1), a(0))? {
                    return Ok(ScriptReply::Nil);
                }
                self.push_pending(&queue_type, k(2), k(3), k(5), a(2), a(0))?;
                self.store_message(k(4), a(1), "PENDING")?;
                if !a(3).is_empty() {
                    let next_at: f64 = a(5)
                        .parse()
                        .map_err(|_| StoreError::RedisError("ERR invalid score".into()))?;
                    self.store_message(k(6), a(4), "SCHEDULED")?;
                    self.zadd(k(1), next_at, a(3))?;
                }
                Ok(ScriptReply::Ok)
            }
            ScriptName::ExtendLock => {
                if self.get(k(0))?.as_deref() == Some(a(0)) {
                    let ttl = a(1).parse().unwrap_or(0);
                    self.pexpire(k(0), ttl);
                    return Ok(ScriptReply::Int(1));
                }
                Ok(ScriptReply::Int(0))
            }
            ScriptName::ReleaseLock => {
                if self.get(k(0))?.as_deref() == Some(a(0)) {
                    self.del(k(0));
                    return Ok(ScriptReply::Int(1));
                }
                Ok(ScriptReply::Int(0))
            }
            ScriptName::RateLimit => {
                let limit: i64 = a(0).parse().unwrap_or(0);
                let count = self.incr(k(0))?;
                if count == 1 {
                    self.pexpire(k(0), a(1).parse().unwrap_or(0));
                }
                Ok(ScriptReply::Int(i64::from(count > limit)))
            }
        }
    }
}

/// In-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Data>>,
    changed: Arc<Notify>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys, for assertions in tests.
    pub async fn key_count(&self) -> usize {
        let mut data = self.data.lock().await;
        let keys: Vec<String> = data.slots.keys().cloned().collect();
        for key in &keys {
            data.purge(key);
        }
        data.slots.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.data.lock().await.get(key)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.data.lock().await.read(key).is_some())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.data.lock().await.hget(key, field)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.data.lock().await.hash(key)?.cloned().unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        Ok(self.data.lock().await.hash(key)?.map_or(0, |h| h.len() as u64))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.data.lock().await.lrange(key, start, stop)
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        Ok(self.data.lock().await.list(key)?.map_or(0, |l| l.len() as u64))
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        Ok(self.data.lock().await.zset(key)?.map_or(0, |z| z.len() as u64))
    }

    async fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> StoreResult<Vec<String>> {
        let mut data = self.data.lock().await;
        Ok(data.zset(key)?.map_or_else(Vec::new, |z| {
            z.iter()
                .take_while(|(score, _)| *score <= max)
                .take(limit)
                .map(|(_, member)| member.clone())
                .collect()
        }))
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut data = self.data.lock().await;
        Ok(data
            .set(key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool> {
        let mut data = self.data.lock().await;
        if data.read(key).is_some() {
            return Ok(false);
        }
        data.slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Str(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
            },
        );
        Ok(true)
    }

    async fn eval(&self, call: ScriptCall) -> StoreResult<ScriptReply> {
        let reply = {
            let mut data = self.data.lock().await;
            // Stage on a copy so a failing script leaves nothing behind.
            let mut staged = data.clone();
            let reply = staged.run_script(&call)?;
            *data = staged;
            reply
        };
        self.changed.notify_waiters();
        Ok(reply)
    }

    async fn blocking_move(
        &self,
        source: &str,
        destination: &str,
        timeout: Option<Duration>,
    ) -> StoreResult<Option<String>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let changed = self.changed.notified();
            if let Some(id) = self.data.lock().await.rpoplpush(source, destination)? {
                return Ok(Some(id));
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, changed).await.is_err() {
                        return Ok(None);
                    }
                }
                None => changed.await,
            }
        }
    }

    async fn commit(&self, tx: Transaction) -> StoreResult<()> {
        {
            let mut data = self.data.lock().await;
            let mut staged = data.clone();
            for op in tx.ops() {
                staged.apply(op)?;
            }
            *data = staged;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        if let Some(sender) = self.channels.lock().await.get(channel) {
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<String>> {
        let mut source = {
            let mut channels = self.channels.lock().await;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if sender.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(receiver)
    }

    fn dedicated(&self) -> Arc<dyn Store> {
        Arc::new(self.clone())
    }
}
