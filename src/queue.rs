use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;

use crate::db;

pub type Attributes = BTreeMap<String, String>;

/// A leased delivery. Only `ack_id` from the latest delivery acknowledges it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub data: Vec<u8>,
    pub attrs: Attributes,
    pub delivery_attempt: u32,
}

/// Topic/subscription message queue with at-least-once delivery.
///
/// Publishing copies a message into every subscription of the topic. A pull
/// leases messages for the subscription's ack deadline; anything not
/// acknowledged before the lease runs out is handed out again.
pub struct Queue {
    conn: Connection,
}

impl Queue {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(db::connect(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let queue = Self { conn };
        queue.init_schema()?;
        Ok(queue)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS topics (
                name       TEXT PRIMARY KEY,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                name              TEXT PRIMARY KEY,
                topic             TEXT NOT NULL REFERENCES topics(name),
                ack_deadline_secs INTEGER NOT NULL,
                created_at        TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS messages (
                id             INTEGER PRIMARY KEY,
                subscription   TEXT NOT NULL REFERENCES subscriptions(name),
                data           BLOB NOT NULL,
                attrs          TEXT NOT NULL,
                published_at   TEXT NOT NULL DEFAULT (datetime('now')),
                delivery_count INTEGER NOT NULL DEFAULT 0,
                ack_id         TEXT,
                lease_until_ms INTEGER,
                acked_at       TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_pending
                ON messages(subscription, acked_at, lease_until_ms);
            ",
        )?;
        Ok(())
    }

    // ── Topics & subscriptions ──

    /// Returns `true` if the topic was created by this call.
    pub fn create_topic(&self, name: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("INSERT OR IGNORE INTO topics (name) VALUES (?1)", [name])?;
        Ok(n > 0)
    }

    pub fn topic_exists(&self, name: &str) -> Result<bool> {
        exists(&self.conn, "SELECT 1 FROM topics WHERE name = ?1", name)
    }

    /// Returns `true` if the subscription was created by this call.
    pub fn create_subscription(&self, name: &str, topic: &str, ack_deadline_secs: u64) -> Result<bool> {
        if !self.topic_exists(topic)? {
            bail!("Topic {:?} does not exist", topic);
        }
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO subscriptions (name, topic, ack_deadline_secs) VALUES (?1, ?2, ?3)",
            rusqlite::params![name, topic, ack_deadline_secs as i64],
        )?;
        Ok(n > 0)
    }

    #[cfg(test)]
    pub fn subscription_exists(&self, name: &str) -> Result<bool> {
        exists(&self.conn, "SELECT 1 FROM subscriptions WHERE name = ?1", name)
    }

    // ── Publishing ──

    #[cfg(test)]
    pub fn publish(&self, topic: &str, data: &[u8], attrs: &Attributes) -> Result<usize> {
        self.publish_batch(topic, &[(data.to_vec(), attrs.clone())])
    }

    /// Publish all messages in one transaction. Returns rows written across
    /// subscriptions.
    pub fn publish_batch(&self, topic: &str, messages: &[(Vec<u8>, Attributes)]) -> Result<usize> {
        if !self.topic_exists(topic)? {
            bail!("Topic {:?} does not exist", topic);
        }
        let tx = self.write_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages (subscription, data, attrs)
                 SELECT name, ?2, ?3 FROM subscriptions WHERE topic = ?1",
            )?;
            for (data, attrs) in messages {
                let attrs = serde_json::to_string(attrs)?;
                count += stmt.execute(rusqlite::params![topic, data, attrs])?;
            }
        }
        tx.commit()?;
        debug!(topic, messages = messages.len(), rows = count, "Published batch");
        Ok(count)
    }

    // ── Consuming ──

    /// Lease up to `max_messages` deliverable messages. Never blocks.
    pub fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        let deadline_secs: i64 = self
            .conn
            .query_row(
                "SELECT ack_deadline_secs FROM subscriptions WHERE name = ?1",
                [subscription],
                |r| r.get(0),
            )
            .optional()?
            .with_context(|| format!("Subscription {:?} does not exist", subscription))?;

        let now_ms = Utc::now().timestamp_millis();
        let lease_until = now_ms + deadline_secs * 1000;

        let tx = self.write_transaction()?;
        let mut out = Vec::new();
        {
            let mut select = tx.prepare(
                "SELECT id, data, attrs, delivery_count FROM messages
                 WHERE subscription = ?1 AND acked_at IS NULL
                   AND (lease_until_ms IS NULL OR lease_until_ms <= ?2)
                 ORDER BY id LIMIT ?3",
            )?;
            let rows = select
                .query_map(
                    rusqlite::params![subscription, now_ms, max_messages as i64],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, u32>(3)?,
                        ))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;

            let mut lease = tx.prepare(
                "UPDATE messages SET delivery_count = ?2, ack_id = ?3, lease_until_ms = ?4 WHERE id = ?1",
            )?;
            for (id, data, attrs, delivered) in rows {
                let attempt = delivered + 1;
                let ack_id = format!("{}-{}", id, attempt);
                lease.execute(rusqlite::params![id, attempt, ack_id, lease_until])?;
                out.push(ReceivedMessage {
                    ack_id,
                    data,
                    attrs: serde_json::from_str(&attrs)
                        .with_context(|| format!("Corrupt attributes on message {}", id))?,
                    delivery_attempt: attempt,
                });
            }
        }
        tx.commit()?;
        Ok(out)
    }

    /// Acknowledge deliveries by ack id. Returns how many were acknowledged;
    /// ids from superseded deliveries match nothing.
    pub fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<usize> {
        let tx = self.write_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE messages SET acked_at = datetime('now')
                 WHERE subscription = ?1 AND ack_id = ?2 AND acked_at IS NULL",
            )?;
            for ack_id in ack_ids {
                count += stmt.execute(rusqlite::params![subscription, ack_id])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// Takes the write lock at BEGIN, where the busy timeout still applies.
    fn write_transaction(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?)
    }

    /// Messages not yet acknowledged, leased or not.
    pub fn pending(&self, subscription: &str) -> Result<usize> {
        let n: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE subscription = ?1 AND acked_at IS NULL",
            [subscription],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

fn exists(conn: &Connection, sql: &str, name: &str) -> Result<bool> {
    Ok(conn
        .query_row(sql, [name], |_| Ok(()))
        .optional()?
        .is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "acts_requests";
    const SUB: &str = "acts_scraper";

    fn queue(ack_deadline_secs: u64) -> Queue {
        let q = Queue::open_in_memory().unwrap();
        q.create_topic(TOPIC).unwrap();
        q.create_subscription(SUB, TOPIC, ack_deadline_secs).unwrap();
        q
    }

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn create_is_idempotent() {
        let q = Queue::open_in_memory().unwrap();
        assert!(!q.topic_exists(TOPIC).unwrap());
        assert!(q.create_topic(TOPIC).unwrap());
        assert!(!q.create_topic(TOPIC).unwrap());
        assert!(q.create_subscription(SUB, TOPIC, 10).unwrap());
        assert!(!q.create_subscription(SUB, TOPIC, 10).unwrap());
        assert!(q.subscription_exists(SUB).unwrap());
        assert!(q.create_subscription("other", "no_such_topic", 10).is_err());
    }

    #[test]
    fn publish_pull_ack() {
        let q = queue(60);
        let a = attrs(&[("type", "main_page")]);
        q.publish(TOPIC, b"http://laws-lois.justice.gc.ca/eng/acts/", &a).unwrap();

        let msgs = q.pull(SUB, 10).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].data, b"http://laws-lois.justice.gc.ca/eng/acts/");
        assert_eq!(msgs[0].attrs, a);
        assert_eq!(msgs[0].delivery_attempt, 1);

        // Leased: not handed out again while the deadline holds.
        assert!(q.pull(SUB, 10).unwrap().is_empty());
        assert_eq!(q.pending(SUB).unwrap(), 1);

        assert_eq!(q.acknowledge(SUB, &[msgs[0].ack_id.clone()]).unwrap(), 1);
        assert_eq!(q.pending(SUB).unwrap(), 0);
        assert!(q.pull(SUB, 10).unwrap().is_empty());
    }

    #[test]
    fn unacked_messages_are_redelivered() {
        let q = queue(0);
        q.publish(TOPIC, b"file:///a", &attrs(&[("type", "letter_page")])).unwrap();

        let first = q.pull(SUB, 1).unwrap();
        let second = q.pull(SUB, 1).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data, first[0].data);
        assert_eq!(second[0].delivery_attempt, 2);
        assert_ne!(second[0].ack_id, first[0].ack_id);

        // The first delivery's ack id is stale.
        assert_eq!(q.acknowledge(SUB, &[first[0].ack_id.clone()]).unwrap(), 0);
        assert_eq!(q.acknowledge(SUB, &[second[0].ack_id.clone()]).unwrap(), 1);
        assert!(q.pull(SUB, 1).unwrap().is_empty());
    }

    #[test]
    fn batch_preserves_order_and_respects_max() {
        let q = queue(60);
        let batch: Vec<_> = ["A.html", "B.html", "C.html"]
            .iter()
            .map(|u| (u.as_bytes().to_vec(), attrs(&[("type", "letter_page")])))
            .collect();
        assert_eq!(q.publish_batch(TOPIC, &batch).unwrap(), 3);

        let first = q.pull(SUB, 2).unwrap();
        assert_eq!(first.iter().map(|m| m.data.as_slice()).collect::<Vec<_>>(), [b"A.html", b"B.html"]);
        let rest = q.pull(SUB, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].data, b"C.html");
    }

    #[test]
    fn fans_out_to_every_subscription() {
        let q = queue(60);
        q.create_subscription("audit", TOPIC, 60).unwrap();
        assert_eq!(q.publish(TOPIC, b"x", &Attributes::new()).unwrap(), 2);
        assert_eq!(q.pull(SUB, 10).unwrap().len(), 1);
        assert_eq!(q.pull("audit", 10).unwrap().len(), 1);
    }

    #[test]
    fn workers_share_one_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acts.sqlite");
        let a = Queue::open(&path).unwrap();
        a.create_topic(TOPIC).unwrap();
        a.create_subscription(SUB, TOPIC, 60).unwrap();
        let b = Queue::open(&path).unwrap();

        let batch: Vec<_> = ["A.html", "B.html"]
            .iter()
            .map(|u| (u.as_bytes().to_vec(), attrs(&[("type", "letter_page")])))
            .collect();
        a.publish_batch(TOPIC, &batch).unwrap();

        // Each lease is visible to the other worker as soon as it commits.
        let first = a.pull(SUB, 1).unwrap();
        let second = b.pull(SUB, 1).unwrap();
        assert_eq!(first[0].data, b"A.html");
        assert_eq!(second[0].data, b"B.html");
        assert!(a.pull(SUB, 10).unwrap().is_empty());

        b.publish(TOPIC, b"C.html", &Attributes::new()).unwrap();
        assert_eq!(b.acknowledge(SUB, &[first[0].ack_id.clone()]).unwrap(), 1);
        assert_eq!(a.acknowledge(SUB, &[second[0].ack_id.clone()]).unwrap(), 1);
        assert_eq!(a.pull(SUB, 10).unwrap()[0].data, b"C.html");
        assert_eq!(b.pending(SUB).unwrap(), 1);
    }

    #[test]
    fn unknown_topic_or_subscription() {
        let q = queue(60);
        assert!(q.publish("nope", b"x", &Attributes::new()).is_err());
        assert!(q.pull("nope", 1).is_err());
    }
}
