// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Stream tailer for collection change events.
//!
//! Every write script appends `{op, key}` to the collection's `:changes`
//! stream. A [`ChangeTailer`] follows that stream with `XREAD BLOCK` and turns
//! entries into [`ChangeEvent`]s.
//!
//! # Stream Trimming
//!
//! The change stream is capped with `MAXLEN ~`. If our cursor points to an
//! entry older than the oldest in the stream, we have fallen behind and may
//! have missed events. The tailer reports this as a
//! [`CoordinationError::ChangeFeed`] so the subscriber resubscribes (and
//! wakes its waiters, which re-check the store themselves).
//!
//! # Collection Drop
//!
//! Dropping a collection appends a final `drop` entry. The tailer ends its
//! stream when it reads one.

use super::{ChangeEvent, ChangeStream, OperationKind};
use crate::error::{CoordinationError, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Cursor meaning "before any entry".
pub const STREAM_START: &str = "0-0";

/// Field value marking a dropped collection.
pub const DROP_OP: &str = "drop";

/// Max entries per XREAD.
const READ_BATCH: usize = 100;

/// One parsed stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEntry {
    Change(ChangeEvent),
    Dropped,
}

/// Tailer for one collection's change stream.
pub struct ChangeTailer {
    /// Collection name (for logging)
    collection: String,
    /// Stream key to tail
    stream_key: String,
    /// Block timeout for XREAD
    block_timeout: Duration,
}

impl ChangeTailer {
    pub fn new(collection: impl Into<String>, stream_key: impl Into<String>, block_timeout: Duration) -> Self {
        Self {
            collection: collection.into(),
            stream_key: stream_key.into(),
            block_timeout,
        }
    }

    /// Get the oldest entry ID in the stream, if any.
    pub async fn get_oldest_id(&self, conn: &mut ConnectionManager) -> Result<Option<String>> {
        // XRANGE key - + COUNT 1 returns the oldest entry
        let result: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| CoordinationError::redis("XRANGE", e))?;

        Ok(result.first().map(|(id, _)| id.clone()))
    }

    /// Get the latest entry ID in the stream, if any.
    pub async fn get_latest_id(&self, conn: &mut ConnectionManager) -> Result<Option<String>> {
        // XREVRANGE key + - COUNT 1 returns the newest entry
        let result: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XREVRANGE")
            .arg(&self.stream_key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| CoordinationError::redis("XREVRANGE", e))?;

        Ok(result.first().map(|(id, _)| id.clone()))
    }

    /// Cursor positioned after every entry that exists now.
    pub async fn current_cursor(&self, conn: &mut ConnectionManager) -> Result<String> {
        Ok(self
            .get_latest_id(conn)
            .await?
            .unwrap_or_else(|| STREAM_START.to_string()))
    }

    /// Returns the oldest ID if the stream was trimmed past `cursor`.
    pub async fn check_cursor_valid(&self, conn: &mut ConnectionManager, cursor: &str) -> Result<Option<String>> {
        if cursor == STREAM_START {
            return Ok(None);
        }
        match self.get_oldest_id(conn).await? {
            Some(oldest) if compare_stream_ids(cursor, &oldest) == std::cmp::Ordering::Less => Ok(Some(oldest)),
            _ => Ok(None),
        }
    }

    /// Read entries after `cursor`, blocking up to the configured timeout.
    ///
    /// Returns `(stream_id, entry)` pairs; empty on timeout.
    pub async fn read_entries(
        &self,
        conn: &mut ConnectionManager,
        cursor: &str,
    ) -> Result<Vec<(String, StreamEntry)>> {
        let opts = StreamReadOptions::default()
            .block(self.block_timeout.as_millis() as usize)
            .count(READ_BATCH);

        // XREAD BLOCK returns nil on timeout
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream_key], &[cursor], &opts)
            .await
            .map_err(|e| CoordinationError::redis("XREAD", e))?;

        let mut entries = Vec::new();
        for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream_key.ids {
                match parse_entry(&entry.map) {
                    Ok(parsed) => {
                        trace!(
                            collection = %self.collection,
                            stream_id = %entry.id,
                            entry = ?parsed,
                            "Parsed change entry"
                        );
                        entries.push((entry.id, parsed));
                    }
                    Err(e) => {
                        warn!(
                            collection = %self.collection,
                            stream_id = %entry.id,
                            error = %e,
                            "Failed to parse change entry, skipping"
                        );
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Follow the stream from `cursor`, yielding events of `kind`.
    ///
    /// The stream yields one `Err` and then ends if the connection fails or
    /// the stream was trimmed past the cursor. It ends without error when the
    /// collection is dropped.
    pub fn into_stream(self, conn: ConnectionManager, cursor: String, kind: OperationKind) -> ChangeStream {
        let state = TailState {
            tailer: self,
            conn,
            cursor,
            buffer: VecDeque::new(),
            finished: false,
        };

        let stream = futures::stream::unfold(state, move |mut state| async move {
            loop {
                if state.finished {
                    return None;
                }

                while let Some(entry) = state.buffer.pop_front() {
                    match entry {
                        StreamEntry::Change(event) if event.kind == kind => return Some((Ok(event), state)),
                        StreamEntry::Change(_) => {}
                        StreamEntry::Dropped => {
                            debug!(collection = %state.tailer.collection, "Collection dropped, ending change stream");
                            return None;
                        }
                    }
                }

                match state.fill().await {
                    Ok(()) => {}
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }
        });

        Box::pin(stream)
    }
}

struct TailState {
    tailer: ChangeTailer,
    conn: ConnectionManager,
    cursor: String,
    buffer: VecDeque<StreamEntry>,
    finished: bool,
}

impl TailState {
    async fn fill(&mut self) -> Result<()> {
        if let Some(oldest) = self.tailer.check_cursor_valid(&mut self.conn, &self.cursor).await? {
            warn!(
                collection = %self.tailer.collection,
                cursor = %self.cursor,
                oldest_id = %oldest,
                "Change stream was trimmed past our cursor"
            );
            return Err(CoordinationError::ChangeFeed(format!(
                "change stream for '{}' trimmed past {}",
                self.tailer.collection, self.cursor
            )));
        }

        let entries = self.tailer.read_entries(&mut self.conn, &self.cursor).await?;
        if let Some((last_id, _)) = entries.last() {
            self.cursor = last_id.clone();
        }
        self.buffer.extend(entries.into_iter().map(|(_, entry)| entry));
        Ok(())
    }
}

fn parse_entry(fields: &HashMap<String, redis::Value>) -> Result<StreamEntry> {
    let op = get_string_field(fields, "op")?;
    if op == DROP_OP {
        return Ok(StreamEntry::Dropped);
    }
    let kind = OperationKind::from_str(&op)
        .ok_or_else(|| CoordinationError::ChangeFeed(format!("Unknown op: {}", op)))?;
    let key = get_string_field(fields, "key")?;
    Ok(StreamEntry::Change(ChangeEvent { key, kind }))
}

/// Extract a string field from a Redis stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| CoordinationError::ChangeFeed(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| CoordinationError::ChangeFeed(format!("Invalid UTF-8 in {}: {}", name, e))),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(CoordinationError::ChangeFeed(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Compare two stream IDs of the form `{timestamp_ms}-{sequence}`.
///
/// Malformed parts compare as zero.
pub fn compare_stream_ids(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> (u64, u64) {
        match s.split_once('-') {
            Some((ts, seq)) => (ts.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
            None => (s.parse().unwrap_or(0), 0),
        }
    };
    parse(a).cmp(&parse(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, redis::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), redis::Value::BulkString(v.as_bytes().to_vec())))
            .collect()
    }

    #[test]
    fn test_compare_stream_ids() {
        assert_eq!(compare_stream_ids("1-0", "2-0"), Ordering::Less);
        assert_eq!(compare_stream_ids("2-5", "2-10"), Ordering::Less);
        assert_eq!(compare_stream_ids("10-0", "9-99"), Ordering::Greater);
        assert_eq!(compare_stream_ids("7-3", "7-3"), Ordering::Equal);
        assert_eq!(compare_stream_ids(STREAM_START, "1-0"), Ordering::Less);
    }

    #[test]
    fn test_compare_stream_ids_malformed() {
        assert_eq!(compare_stream_ids("garbage", "0-0"), Ordering::Equal);
        assert_eq!(compare_stream_ids("5", "5-0"), Ordering::Equal);
    }

    #[test]
    fn test_parse_change_entry() {
        let entry = parse_entry(&fields(&[("op", "delete"), ("key", "L")])).unwrap();
        assert_eq!(
            entry,
            StreamEntry::Change(ChangeEvent {
                key: "L".into(),
                kind: OperationKind::Delete
            })
        );
    }

    #[test]
    fn test_parse_drop_entry() {
        assert_eq!(parse_entry(&fields(&[("op", "drop")])).unwrap(), StreamEntry::Dropped);
    }

    #[test]
    fn test_parse_rejects_unknown_op_and_missing_key() {
        assert!(parse_entry(&fields(&[("op", "merge"), ("key", "k")])).is_err());
        assert!(parse_entry(&fields(&[("op", "insert")])).is_err());
        assert!(parse_entry(&fields(&[])).is_err());
    }

    #[test]
    fn test_get_string_field_types() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), redis::Value::SimpleString("x".into()));
        map.insert("b".to_string(), redis::Value::Int(3));
        assert_eq!(get_string_field(&map, "a").unwrap(), "x");
        assert!(get_string_field(&map, "b").is_err());
    }
}
