// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed document store.
//!
//! # Key Layout
//!
//! For collection `C` under prefix `P`:
//!
//! ```text
//! P C:doc:<key>   hash    payload, hash, owner, expire_at, created_at
//! P C:idx         zset    every live key, score 0 (lexicographic order)
//! P C:exp         zset    keys with a deadline, score = expire_at
//! P C:changes     stream  {op, key} per write, XADD MAXLEN ~
//! ```
//!
//! Every operation is one Lua script, so each is atomic with respect to all
//! other clients. Each script first purges documents whose deadline has
//! passed (publishing a `delete` for each), which makes expiry exact without
//! depending on the background sweeper.
//!
//! Document keys are derived inside the scripts, so this backend targets a
//! single Redis node (or a cluster with one slot per deployment prefix).

use super::stream::{ChangeTailer, DROP_OP};
use super::{
    BoxFuture, ChangeStream, Document, DocumentStore, Filter, InsertOutcome, KeyRange, OperationKind, Precondition,
    SortOrder, Update, now_millis,
};
use crate::circuit_breaker::{Access, StoreCircuit};
use crate::config::RedisConfig;
use crate::error::{CoordinationError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use dashmap::DashSet;
use redis::aio::ConnectionManager;
use redis::{Client, Script, Value};
use std::ops::Bound;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

// =============================================================================
// Lua scripts
// =============================================================================

/// Shared prelude. KEYS: idx, exp, changes. ARGV: doc prefix, now, maxlen.
const LUA_PRELUDE: &str = r#"
local idx, exp, changes = KEYS[1], KEYS[2], KEYS[3]
local prefix = ARGV[1]
local now = tonumber(ARGV[2])
local maxlen = ARGV[3]

local function emit(op, key)
  redis.call('XADD', changes, 'MAXLEN', '~', maxlen, '*', 'op', op, 'key', key)
end

local function remove_doc(key)
  redis.call('DEL', prefix .. key)
  redis.call('ZREM', idx, key)
  redis.call('ZREM', exp, key)
end

local function purge_expired()
  local due = redis.call('ZRANGEBYSCORE', exp, '-inf', now)
  for _, key in ipairs(due) do
    remove_doc(key)
    emit('delete', key)
  end
  return #due
end

local function is_live(key)
  return redis.call('ZSCORE', idx, key) ~= false
end

local function write_doc(base)
  local key = ARGV[base]
  local doc = prefix .. key
  redis.call('DEL', doc)
  redis.call('HSET', doc, 'payload', ARGV[base + 1], 'created_at', ARGV[base + 5])
  if ARGV[base + 2] ~= '' then redis.call('HSET', doc, 'hash', ARGV[base + 2]) end
  if ARGV[base + 3] ~= '' then redis.call('HSET', doc, 'owner', ARGV[base + 3]) end
  redis.call('ZADD', idx, 0, key)
  if ARGV[base + 4] ~= '' then
    redis.call('HSET', doc, 'expire_at', ARGV[base + 4])
    redis.call('ZADD', exp, ARGV[base + 4], key)
  else
    redis.call('ZREM', exp, key)
  end
  return key
end

local function read_doc(key)
  local fields = redis.call('HGETALL', prefix .. key)
  if #fields == 0 then return false end
  table.insert(fields, 1, key)
  return fields
end

local function owner_matches(key, owner)
  return owner == '' or redis.call('HGET', prefix .. key, 'owner') == owner
end

local purged = purge_expired()
"#;

/// Documents start at ARGV[4], six fields each.
const LUA_INSERT: &str = r#"
local seen = {}
for base = 4, #ARGV, 6 do
  local key = ARGV[base]
  if seen[key] or is_live(key) then return 0 end
  seen[key] = true
end
for base = 4, #ARGV, 6 do
  emit('insert', write_doc(base))
end
return 1
"#;

const LUA_UPSERT: &str = r#"
local previous = {}
for base = 4, #ARGV, 6 do
  local prev = read_doc(ARGV[base])
  local key = write_doc(base)
  if prev then
    emit('update', key)
    table.insert(previous, prev)
  else
    emit('insert', key)
    table.insert(previous, 0)
  end
end
return previous
"#;

/// ARGV[4] key, ARGV[5] owner ('' = always), ARGV[6] expire_at ('' = keep).
const LUA_CONDITIONAL_UPDATE: &str = r#"
local key, owner, expire_at = ARGV[4], ARGV[5], ARGV[6]
if not is_live(key) or not owner_matches(key, owner) then return 0 end
if expire_at ~= '' then
  redis.call('HSET', prefix .. key, 'expire_at', expire_at)
  redis.call('ZADD', exp, expire_at, key)
end
emit('update', key)
return 1
"#;

const LUA_GET: &str = r#"
return read_doc(ARGV[4])
"#;

/// ARGV[4] mode (docs|count|delete), ARGV[5] min, ARGV[6] max,
/// ARGV[7] order (asc|desc), ARGV[8] limit (0 = none), ARGV[9] hash ('' = any).
const LUA_SCAN: &str = r#"
local mode, min, max, order = ARGV[4], ARGV[5], ARGV[6], ARGV[7]
local limit, hash = tonumber(ARGV[8]), ARGV[9]
local page, offset, n, done = 256, 0, 0, false
local out = {}
while not done do
  local keys
  if order == 'asc' then
    keys = redis.call('ZRANGEBYLEX', idx, min, max, 'LIMIT', offset, page)
  else
    keys = redis.call('ZREVRANGEBYLEX', idx, max, min, 'LIMIT', offset, page)
  end
  for _, key in ipairs(keys) do
    if hash == '' or redis.call('HGET', prefix .. key, 'hash') == hash then
      n = n + 1
      if mode == 'docs' then
        table.insert(out, read_doc(key))
      elseif mode == 'delete' then
        table.insert(out, key)
      end
      if limit > 0 and n >= limit then
        done = true
        break
      end
    end
  end
  if #keys < page then done = true end
  offset = offset + page
end
if mode == 'count' then return n end
if mode == 'delete' then
  for _, key in ipairs(out) do
    remove_doc(key)
    emit('delete', key)
  end
  return n
end
return out
"#;

/// ARGV[4] key, ARGV[5] owner ('' = always).
const LUA_DELETE: &str = r#"
local key, owner = ARGV[4], ARGV[5]
local doc = read_doc(key)
if not doc or not owner_matches(key, owner) then return false end
remove_doc(key)
emit('delete', key)
return doc
"#;

/// The prelude does the work.
const LUA_SWEEP: &str = r#"
return purged
"#;

/// ARGV[4] drop marker. Removes every document and ends open change feeds.
const LUA_DROP: &str = r#"
local keys = redis.call('ZRANGE', idx, 0, -1)
for _, key in ipairs(keys) do
  redis.call('DEL', prefix .. key)
end
redis.call('DEL', idx, exp)
redis.call('XADD', changes, 'MAXLEN', '~', maxlen, '*', 'op', ARGV[4])
return #keys
"#;

struct Scripts {
    insert: Script,
    upsert: Script,
    conditional_update: Script,
    get: Script,
    scan: Script,
    delete: Script,
    sweep: Script,
    drop: Script,
}

impl Scripts {
    fn load() -> Self {
        let build = |body: &str| Script::new(&format!("{}{}", LUA_PRELUDE, body));
        Self {
            insert: build(LUA_INSERT),
            upsert: build(LUA_UPSERT),
            conditional_update: build(LUA_CONDITIONAL_UPDATE),
            get: build(LUA_GET),
            scan: build(LUA_SCAN),
            delete: build(LUA_DELETE),
            sweep: build(LUA_SWEEP),
            drop: build(LUA_DROP),
        }
    }
}

/// Redis key names for one collection.
struct CollectionKeys {
    idx: String,
    exp: String,
    changes: String,
    doc_prefix: String,
}

// =============================================================================
// RedisStore
// =============================================================================

/// [`DocumentStore`] backed by Redis.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    config: RedisConfig,
    scripts: Scripts,
    circuit: StoreCircuit,
    /// Collections this process has used; the sweeper visits these.
    touched: DashSet<String>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RedisStore {
    /// Connect with the startup retry schedule and start the expiry sweeper.
    pub async fn connect(config: RedisConfig) -> Result<Arc<Self>> {
        Self::connect_with_retry(config, &RetryConfig::startup()).await
    }

    pub async fn connect_with_retry(config: RedisConfig, retry_config: &RetryConfig) -> Result<Arc<Self>> {
        info!(url = %config.url, prefix = %config.key_prefix, "Connecting to Redis store");

        let client = Client::open(config.url.as_str())
            .map_err(|e| CoordinationError::Config(format!("Invalid Redis URL: {}", e)))?;
        let conn = open_connection(&client, retry_config).await?;

        let circuit = StoreCircuit::for_store(&config);
        let sweep_interval = config.sweep_interval();

        let store = Arc::new(Self {
            client,
            conn,
            config,
            scripts: Scripts::load(),
            circuit,
            touched: DashSet::new(),
            sweeper: Mutex::new(None),
        });

        if let Some(interval) = sweep_interval {
            let handle = tokio::spawn(sweep_loop(Arc::downgrade(&store), interval));
            if let Ok(mut slot) = store.sweeper.lock() {
                *slot = Some(handle);
            }
        }

        Ok(store)
    }

    /// The store's circuit breakers.
    pub fn circuit(&self) -> &StoreCircuit {
        &self.circuit
    }

    /// Purge expired documents in every collection this process has used.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let collections: Vec<String> = self.touched.iter().map(|c| c.key().clone()).collect();
        let mut purged = 0;
        for collection in collections {
            let value = self.run(&self.scripts.sweep, "sweep", Access::Write, &collection, Vec::new()).await?;
            let n = value_to_i64(&value).unwrap_or(0).max(0) as usize;
            if n > 0 {
                trace!(collection = %collection, purged = n, "Swept expired documents");
            }
            purged += n;
        }
        Ok(purged)
    }

    /// Delete a collection and end change feeds open on it.
    pub async fn drop_collection(&self, collection: &str) -> Result<u64> {
        let value = self
            .run(&self.scripts.drop, "drop", Access::Write, collection, vec![DROP_OP.as_bytes().to_vec()])
            .await?;
        self.touched.remove(collection);
        let dropped = value_to_i64(&value).unwrap_or(0) as u64;
        debug!(collection, dropped, "Dropped collection");
        Ok(dropped)
    }

    fn keys(&self, collection: &str) -> CollectionKeys {
        let base = format!("{}{}", self.config.key_prefix, collection);
        CollectionKeys {
            idx: format!("{}:idx", base),
            exp: format!("{}:exp", base),
            changes: format!("{}:changes", base),
            doc_prefix: format!("{}:doc:", base),
        }
    }

    /// Run one script against a collection through the circuit breaker.
    async fn run(
        &self,
        script: &Script,
        operation: &'static str,
        access: Access,
        collection: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<Value> {
        if !self.touched.contains(collection) {
            self.touched.insert(collection.to_string());
        }

        let keys = self.keys(collection);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(&keys.idx)
            .key(&keys.exp)
            .key(&keys.changes)
            .arg(&keys.doc_prefix)
            .arg(now_millis())
            .arg(self.config.change_stream_maxlen);
        for arg in args {
            invocation.arg(arg);
        }

        let mut conn = self.conn.clone();
        let call = move || async move {
            let value: Value = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(|e| CoordinationError::redis(operation, e))?;
            Ok(value)
        };

        let start = Instant::now();
        let result = self.circuit.guard(access, operation, call).await;
        metrics::record_store_operation("redis", operation, start.elapsed(), result.is_ok());
        result
    }

    async fn scan_script(
        &self,
        collection: &str,
        mode: &str,
        filter: &Filter,
        order: SortOrder,
        limit: usize,
    ) -> Result<Value> {
        let (min, max) = lex_bounds(&filter.range);
        let order = match order {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        };
        let args = vec![
            mode.as_bytes().to_vec(),
            min.into_bytes(),
            max.into_bytes(),
            order.as_bytes().to_vec(),
            limit.to_string().into_bytes(),
            filter.content_hash.clone().unwrap_or_default().into_bytes(),
        ];
        let operation = match mode {
            "count" => "count",
            "delete" => "delete_many",
            _ => "scan",
        };
        let access = if mode == "delete" { Access::Write } else { Access::Read };
        self.run(&self.scripts.scan, operation, access, collection, args)
            .await
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

async fn open_connection(client: &Client, retry_config: &RetryConfig) -> Result<ConnectionManager> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        // Bound each attempt so an unreachable host cannot hang startup
        let failure = match timeout(retry_config.connection_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => {
                metrics::record_store_connection("redis", true);
                if attempt > 1 {
                    info!(attempt, "Connected to Redis store after retry");
                } else {
                    info!("Connected to Redis store");
                }
                return Ok(conn);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", retry_config.connection_timeout),
        };

        metrics::record_store_connection("redis", false);
        if attempt >= retry_config.max_attempts {
            error!(attempt, error = %failure, "Failed to connect to Redis store after max retries");
            return Err(CoordinationError::store(
                "connect",
                format!("connection failed after {} attempts: {}", attempt, failure),
            ));
        }

        let delay = retry_config.delay_for_attempt(attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Redis connection attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

async fn sweep_loop(store: Weak<RedisStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
            return;
        };
        match store.sweep_expired().await {
            Ok(purged) => metrics::record_expired_swept("redis", purged),
            Err(e) => debug!(error = %e, "Expiry sweep failed"),
        }
        store.circuit.publish_state();
    }
}

// =============================================================================
// Argument encoding and reply parsing
// =============================================================================

fn doc_args(doc: Document, out: &mut Vec<Vec<u8>>) {
    out.push(doc.key.into_bytes());
    out.push(doc.payload);
    out.push(doc.content_hash.unwrap_or_default().into_bytes());
    out.push(doc.owner.unwrap_or_default().into_bytes());
    out.push(doc.expire_at.map(|at| at.to_string()).unwrap_or_default().into_bytes());
    out.push(doc.created_at.to_string().into_bytes());
}

/// ZRANGEBYLEX bounds for a key range.
fn lex_bounds(range: &KeyRange) -> (String, String) {
    let encode = |bound: &Bound<String>, unbounded: &str| match bound {
        Bound::Unbounded => unbounded.to_string(),
        Bound::Included(k) => format!("[{}", k),
        Bound::Excluded(k) => format!("({}", k),
    };
    (encode(&range.lower, "-"), encode(&range.upper, "+"))
}

fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes.clone()),
        Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        Value::Int(i) => Some(i.to_string().into_bytes()),
        _ => None,
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        other => value_to_bytes(other).and_then(|b| String::from_utf8(b).ok()?.parse().ok()),
    }
}

fn value_to_string(value: &Value) -> Result<String> {
    let bytes = value_to_bytes(value)
        .ok_or_else(|| CoordinationError::store("decode", format!("expected string, got {:?}", value)))?;
    String::from_utf8(bytes).map_err(|e| CoordinationError::store("decode", format!("invalid UTF-8: {}", e)))
}

/// Parse a `read_doc` reply: `[key, field, value, ...]`, or nil/0 for none.
fn parse_document(value: &Value) -> Result<Option<Document>> {
    let items = match value {
        Value::Nil | Value::Int(0) => return Ok(None),
        Value::Array(items) => items,
        other => {
            return Err(CoordinationError::store(
                "decode",
                format!("unexpected document reply: {:?}", other),
            ))
        }
    };

    let (key, fields) = items
        .split_first()
        .ok_or_else(|| CoordinationError::store("decode", "empty document reply"))?;
    let mut doc = Document::new(value_to_string(key)?, Vec::new());

    for pair in fields.chunks(2) {
        let [name, field] = pair else {
            return Err(CoordinationError::store("decode", "odd field count in document reply"));
        };
        match value_to_string(name)?.as_str() {
            "payload" => doc.payload = value_to_bytes(field).unwrap_or_default(),
            "hash" => doc.content_hash = Some(value_to_string(field)?),
            "owner" => doc.owner = Some(value_to_string(field)?),
            "expire_at" => doc.expire_at = value_to_i64(field),
            "created_at" => doc.created_at = value_to_i64(field).unwrap_or(doc.created_at),
            _ => {}
        }
    }
    Ok(Some(doc))
}

fn parse_documents(value: &Value) -> Result<Vec<Option<Document>>> {
    match value {
        Value::Array(items) => items.iter().map(parse_document).collect(),
        Value::Nil => Ok(Vec::new()),
        other => Err(CoordinationError::store(
            "decode",
            format!("unexpected list reply: {:?}", other),
        )),
    }
}

// =============================================================================
// DocumentStore
// =============================================================================

impl DocumentStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    fn insert_if_absent<'a>(&'a self, collection: &'a str, doc: Document) -> BoxFuture<'a, InsertOutcome> {
        self.insert_batch(collection, vec![doc])
    }

    fn insert_batch<'a>(&'a self, collection: &'a str, docs: Vec<Document>) -> BoxFuture<'a, InsertOutcome> {
        Box::pin(async move {
            if docs.is_empty() {
                return Ok(InsertOutcome::Inserted);
            }
            let mut args = Vec::with_capacity(docs.len() * 6);
            for doc in docs {
                doc_args(doc, &mut args);
            }
            let value = self.run(&self.scripts.insert, "insert", Access::Write, collection, args).await?;
            Ok(match value_to_i64(&value) {
                Some(1) => InsertOutcome::Inserted,
                _ => InsertOutcome::DuplicateKey,
            })
        })
    }

    fn upsert<'a>(&'a self, collection: &'a str, doc: Document) -> BoxFuture<'a, Option<Document>> {
        Box::pin(async move {
            let mut args = Vec::with_capacity(6);
            doc_args(doc, &mut args);
            let value = self.run(&self.scripts.upsert, "upsert", Access::Write, collection, args).await?;
            Ok(parse_documents(&value)?.into_iter().next().flatten())
        })
    }

    fn upsert_batch<'a>(&'a self, collection: &'a str, docs: Vec<Document>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if docs.is_empty() {
                return Ok(());
            }
            let mut args = Vec::with_capacity(docs.len() * 6);
            for doc in docs {
                doc_args(doc, &mut args);
            }
            self.run(&self.scripts.upsert, "upsert_batch", Access::Write, collection, args)
                .await?;
            Ok(())
        })
    }

    fn conditional_update<'a>(
        &'a self,
        collection: &'a str,
        key: &'a str,
        precondition: &'a Precondition,
        update: &'a Update,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let args = vec![
                key.as_bytes().to_vec(),
                precondition.owner_arg().as_bytes().to_vec(),
                update.expire_at.map(|at| at.to_string()).unwrap_or_default().into_bytes(),
            ];
            let value = self
                .run(&self.scripts.conditional_update, "conditional_update", Access::Write, collection, args)
                .await?;
            Ok(value_to_i64(&value).unwrap_or(0).max(0) as u64)
        })
    }

    fn get<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, Option<Document>> {
        Box::pin(async move {
            let value = self
                .run(&self.scripts.get, "get", Access::Read, collection, vec![key.as_bytes().to_vec()])
                .await?;
            parse_document(&value)
        })
    }

    fn find_one<'a>(&'a self, collection: &'a str, filter: &'a Filter, order: SortOrder) -> BoxFuture<'a, Option<Document>> {
        Box::pin(async move {
            if filter.range.is_empty() {
                return Ok(None);
            }
            let value = self.scan_script(collection, "docs", filter, order, 1).await?;
            Ok(parse_documents(&value)?.into_iter().flatten().next())
        })
    }

    fn scan<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Filter,
        order: SortOrder,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Document>> {
        Box::pin(async move {
            if filter.range.is_empty() || limit == 0 {
                return Ok(Vec::new());
            }
            let value = self.scan_script(collection, "docs", filter, order, limit).await?;
            Ok(parse_documents(&value)?.into_iter().flatten().collect())
        })
    }

    fn count<'a>(&'a self, collection: &'a str, filter: &'a Filter) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            if filter.range.is_empty() {
                return Ok(0);
            }
            let value = self
                .scan_script(collection, "count", filter, SortOrder::Ascending, 0)
                .await?;
            Ok(value_to_i64(&value).unwrap_or(0).max(0) as u64)
        })
    }

    fn delete_one<'a>(
        &'a self,
        collection: &'a str,
        key: &'a str,
        precondition: &'a Precondition,
    ) -> BoxFuture<'a, Option<Document>> {
        Box::pin(async move {
            let args = vec![key.as_bytes().to_vec(), precondition.owner_arg().as_bytes().to_vec()];
            let value = self.run(&self.scripts.delete, "delete", Access::Write, collection, args).await?;
            parse_document(&value)
        })
    }

    fn delete_many<'a>(&'a self, collection: &'a str, filter: &'a Filter) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            if filter.range.is_empty() {
                return Ok(0);
            }
            let value = self
                .scan_script(collection, "delete", filter, SortOrder::Ascending, 0)
                .await?;
            Ok(value_to_i64(&value).unwrap_or(0).max(0) as u64)
        })
    }

    fn watch<'a>(&'a self, collection: &'a str, kind: OperationKind) -> BoxFuture<'a, ChangeStream> {
        Box::pin(async move {
            self.touched.insert(collection.to_string());
            let keys = self.keys(collection);

            // XREAD BLOCK would stall the shared multiplexed connection,
            // so every subscription gets its own.
            let mut conn = self
                .client
                .get_connection_manager()
                .await
                .map_err(|e| CoordinationError::redis("watch", e))?;

            let tailer = ChangeTailer::new(collection, keys.changes, self.config.block_timeout_duration());
            let cursor = tailer.current_cursor(&mut conn).await?;
            debug!(collection, kind = %kind, cursor = %cursor, "Opened change stream");
            Ok(tailer.into_stream(conn, cursor, kind))
        })
    }
}
