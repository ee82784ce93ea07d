//! # Storage Module - Persisted Message History
//!
//! Chat history lives in an embedded key-value store ([`sled`]) with one
//! record per mesh message, keyed by `origin_id(8) || seqno(u32 BE)`. That
//! key is the message's global identity, which makes insert-if-absent the
//! natural dedup point for everything arriving twice: flooded duplicates,
//! re-sent sync responses, overlapping range replies.
//!
//! Channel-scoped queries scan and sort in memory. Message volumes on a
//! low-bandwidth mesh stay small and the store is pruned, so a scan is
//! cheaper than maintaining secondary indexes would be.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::mesh::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sled(#[from] sled::Error),

    #[error("record codec failure: {0}")]
    Codec(#[from] bincode::Error),

    #[error("corrupt store key ({0} bytes)")]
    BadKey(usize),
}

/// Value half of a record; origin and seqno live in the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordBody {
    channel: String,
    nick: String,
    text: String,
    ts: f64,
}

/// One stored chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub origin: NodeId,
    pub seqno: u32,
    pub channel: String,
    pub nick: String,
    pub text: String,
    pub ts: f64,
}

/// Persistent chat log. One store per node.
pub struct MessageStore {
    db: sled::Db,
    messages: sled::Tree,
}

impl MessageStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let messages = db.open_tree("messages")?;
        Ok(Self { db, messages })
    }

    /// Insert a message unless `(origin, seqno)` is already present.
    /// Returns `true` when the record was newly inserted.
    pub fn insert_if_absent(
        &self,
        origin: NodeId,
        seqno: u32,
        channel: &str,
        nick: &str,
        text: &str,
        ts: f64,
    ) -> Result<bool, StoreError> {
        let body = RecordBody {
            channel: channel.to_string(),
            nick: nick.to_string(),
            text: text.to_string(),
            ts,
        };
        let value = bincode::serialize(&body)?;
        let outcome = self.messages.compare_and_swap(
            record_key(origin, seqno),
            None as Option<&[u8]>,
            Some(value),
        )?;
        Ok(outcome.is_ok())
    }

    pub fn has(&self, origin: NodeId, seqno: u32) -> Result<bool, StoreError> {
        Ok(self.messages.contains_key(record_key(origin, seqno))?)
    }

    pub fn get(&self, origin: NodeId, seqno: u32) -> Result<Option<StoredMessage>, StoreError> {
        match self.messages.get(record_key(origin, seqno))? {
            Some(value) => Ok(Some(decode_record(&record_key(origin, seqno), &value)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The newest `limit` messages in a channel, oldest first.
    pub fn recent(&self, channel: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let mut rows = self.channel_rows(channel)?;
        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        Ok(rows)
    }

    /// Messages in a channel with `ts > since_ts`, oldest first, capped.
    pub fn since(
        &self,
        channel: &str,
        since_ts: f64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut rows = self.channel_rows(channel)?;
        rows.retain(|m| m.ts > since_ts);
        rows.truncate(limit);
        Ok(rows)
    }

    /// Highest held seqno per origin across the newest `last_n` messages of
    /// a channel, keyed by origin hex. This is the advertisement a
    /// seqno-inventory sync request carries.
    pub fn inventory(
        &self,
        channel: &str,
        last_n: usize,
    ) -> Result<BTreeMap<String, u32>, StoreError> {
        let mut inv = BTreeMap::new();
        for msg in self.recent(channel, last_n)? {
            let entry = inv.entry(msg.origin.to_hex()).or_insert(msg.seqno);
            if msg.seqno > *entry {
                *entry = msg.seqno;
            }
        }
        Ok(inv)
    }

    /// Contiguous seqno slice `[start, end]` for one origin, optionally
    /// confined to a channel. Ordered by seqno.
    pub fn range(
        &self,
        origin: NodeId,
        start: u32,
        end: u32,
        channel: Option<&str>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let lo = record_key(origin, start);
        let hi = record_key(origin, end);
        let mut rows = Vec::new();
        for item in self.messages.range(lo..=hi) {
            let (key, value) = item?;
            let msg = decode_record(&key, &value)?;
            if channel.map_or(true, |c| msg.channel == c) {
                rows.push(msg);
            }
        }
        Ok(rows)
    }

    /// Channel of the newest stored message from one origin, if any. Used
    /// to aim range-sync requests, which are channel-scoped on the wire.
    pub fn last_channel_for_origin(
        &self,
        origin: NodeId,
    ) -> Result<Option<String>, StoreError> {
        let mut newest: Option<(f64, String)> = None;
        for item in self.messages.scan_prefix(origin.as_bytes()) {
            let (key, value) = item?;
            let msg = decode_record(&key, &value)?;
            if newest.as_ref().map_or(true, |(ts, _)| msg.ts > *ts) {
                newest = Some((msg.ts, msg.channel));
            }
        }
        Ok(newest.map(|(_, channel)| channel))
    }

    /// Distinct channel identifiers ordered by most recent activity. Covers
    /// normal channels and DM keys alike.
    pub fn channels(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut last_ts: BTreeMap<String, f64> = BTreeMap::new();
        for item in self.messages.iter() {
            let (key, value) = item?;
            let msg = decode_record(&key, &value)?;
            let entry = last_ts.entry(msg.channel).or_insert(msg.ts);
            if msg.ts > *entry {
                *entry = msg.ts;
            }
        }
        let mut channels: Vec<(String, f64)> = last_ts.into_iter().collect();
        channels.sort_by(|a, b| b.1.total_cmp(&a.1));
        channels.truncate(limit);
        Ok(channels.into_iter().map(|(c, _)| c).collect())
    }

    /// Keep only the newest `keep_last_n` messages per channel. Returns the
    /// number of deleted records.
    pub fn prune_keep_last_n(&self, keep_last_n: usize) -> Result<usize, StoreError> {
        let mut by_channel: BTreeMap<String, Vec<(f64, Vec<u8>)>> = BTreeMap::new();
        for item in self.messages.iter() {
            let (key, value) = item?;
            let msg = decode_record(&key, &value)?;
            by_channel
                .entry(msg.channel)
                .or_default()
                .push((msg.ts, key.to_vec()));
        }
        let mut deleted = 0usize;
        for (_, mut rows) in by_channel {
            if rows.len() <= keep_last_n {
                continue;
            }
            rows.sort_by(|a, b| a.0.total_cmp(&b.0));
            let excess = rows.len() - keep_last_n;
            for (_, key) in rows.into_iter().take(excess) {
                if self.messages.remove(key)?.is_some() {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn channel_rows(&self, channel: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let mut rows = Vec::new();
        for item in self.messages.iter() {
            let (key, value) = item?;
            let msg = decode_record(&key, &value)?;
            if msg.channel == channel {
                rows.push(msg);
            }
        }
        rows.sort_by(|a, b| a.ts.total_cmp(&b.ts).then(a.seqno.cmp(&b.seqno)));
        Ok(rows)
    }
}

fn record_key(origin: NodeId, seqno: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(origin.as_bytes());
    key[8..].copy_from_slice(&seqno.to_be_bytes());
    key
}

fn decode_record(key: &[u8], value: &[u8]) -> Result<StoredMessage, StoreError> {
    if key.len() != 12 {
        return Err(StoreError::BadKey(key.len()));
    }
    let origin = NodeId::from_slice(key).ok_or(StoreError::BadKey(key.len()))?;
    let seqno = u32::from_be_bytes([key[8], key[9], key[10], key[11]]);
    let body: RecordBody = bincode::deserialize(value)?;
    Ok(StoredMessage {
        origin,
        seqno,
        channel: body.channel,
        nick: body.nick,
        text: body.text,
        ts: body.ts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, MessageStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MessageStore::open(dir.path().join("db")).expect("open store");
        (dir, store)
    }

    fn put(store: &MessageStore, origin: &str, seqno: u32, channel: &str, ts: f64) -> bool {
        store
            .insert_if_absent(
                NodeId::from_callsign(origin),
                seqno,
                channel,
                origin,
                &format!("msg {}", seqno),
                ts,
            )
            .expect("insert")
    }

    #[test]
    fn insert_is_idempotent() {
        let (_dir, store) = open_store();
        let origin = NodeId::from_callsign("K1ABC");
        assert!(put(&store, "K1ABC", 1, "#general", 10.0));
        assert!(!put(&store, "K1ABC", 1, "#general", 20.0));
        assert_eq!(store.len(), 1);
        let msg = store.get(origin, 1).unwrap().unwrap();
        assert_eq!(msg.ts, 10.0); // first write wins
    }

    #[test]
    fn recent_returns_newest_ascending() {
        let (_dir, store) = open_store();
        for i in 1..=5 {
            put(&store, "K1ABC", i, "#general", i as f64);
        }
        put(&store, "K1ABC", 6, "#other", 100.0);
        let recent = store.recent("#general", 3).unwrap();
        assert_eq!(
            recent.iter().map(|m| m.seqno).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
    }

    #[test]
    fn since_filters_strictly_newer() {
        let (_dir, store) = open_store();
        for i in 1..=4 {
            put(&store, "K1ABC", i, "#general", i as f64 * 10.0);
        }
        let rows = store.since("#general", 20.0, 100).unwrap();
        assert_eq!(rows.iter().map(|m| m.seqno).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn inventory_tracks_max_seqno_per_origin() {
        let (_dir, store) = open_store();
        put(&store, "AAA", 8, "#general", 1.0);
        put(&store, "AAA", 11, "#general", 3.0);
        put(&store, "BBB", 2, "#general", 2.0);
        let inv = store.inventory("#general", 50).unwrap();
        assert_eq!(inv.get(&NodeId::from_callsign("AAA").to_hex()), Some(&11));
        assert_eq!(inv.get(&NodeId::from_callsign("BBB").to_hex()), Some(&2));
    }

    #[test]
    fn range_slices_one_origin() {
        let (_dir, store) = open_store();
        for i in 1..=9 {
            put(&store, "AAA", i, "#general", i as f64);
        }
        put(&store, "BBB", 5, "#general", 50.0);
        let rows = store
            .range(NodeId::from_callsign("AAA"), 3, 6, Some("#general"))
            .unwrap();
        assert_eq!(
            rows.iter().map(|m| m.seqno).collect::<Vec<_>>(),
            vec![3, 4, 5, 6]
        );
        let cross_channel = store
            .range(NodeId::from_callsign("AAA"), 3, 6, Some("#missing"))
            .unwrap();
        assert!(cross_channel.is_empty());
    }

    #[test]
    fn channels_by_recency() {
        let (_dir, store) = open_store();
        put(&store, "AAA", 1, "#old", 10.0);
        put(&store, "AAA", 2, "#hot", 99.0);
        put(&store, "AAA", 3, "#mid", 50.0);
        assert_eq!(
            store.channels(10).unwrap(),
            vec!["#hot".to_string(), "#mid".to_string(), "#old".to_string()]
        );
    }

    #[test]
    fn prune_keeps_newest_per_channel() {
        let (_dir, store) = open_store();
        for i in 1..=10 {
            put(&store, "AAA", i, "#general", i as f64);
        }
        for i in 1..=3 {
            put(&store, "BBB", i, "#dm", i as f64);
        }
        let deleted = store.prune_keep_last_n(4).unwrap();
        assert_eq!(deleted, 6);
        assert_eq!(store.recent("#general", 100).unwrap().len(), 4);
        assert_eq!(store.recent("#dm", 100).unwrap().len(), 3);
    }
}
