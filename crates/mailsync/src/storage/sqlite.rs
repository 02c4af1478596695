//! SQLite-backed engine storage
//!
//! One connection behind a mutex. Emails are keyed by `(account_id, id)`;
//! labels live in a join table so label predicates stay indexable.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use rusqlite_migration::{M, Migrations};
use uuid::Uuid;

use super::traits::{
    EmailQuery, MailStore, OutboxStore, SeenIdStore, SummaryStore, TimestampLog,
};
use crate::models::{
    Email, EmailAddress, HistoryCursor, MessageId, OutboxStatus, QueuedOutboundEmail, SyncState,
    ThreadId, labels,
};

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // 1: mailbox mirror
        M::up(
            r#"
            CREATE TABLE emails (
                account_id INTEGER NOT NULL,
                id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                from_name TEXT,
                from_email TEXT NOT NULL,
                to_json TEXT NOT NULL DEFAULT '[]',
                subject TEXT NOT NULL,
                snippet TEXT NOT NULL,
                received_at TEXT NOT NULL,
                internal_date INTEGER NOT NULL,
                has_list_unsubscribe INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (account_id, id)
            );

            CREATE INDEX idx_emails_internal_date
                ON emails(account_id, internal_date DESC);

            CREATE TABLE email_labels (
                account_id INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                label_id TEXT NOT NULL,
                PRIMARY KEY (account_id, message_id, label_id),
                FOREIGN KEY (account_id, message_id)
                    REFERENCES emails(account_id, id) ON DELETE CASCADE
            );

            CREATE INDEX idx_email_labels_label ON email_labels(account_id, label_id);

            CREATE TABLE sync_state (
                account_id INTEGER PRIMARY KEY,
                cursor TEXT NOT NULL,
                last_sync_at TEXT NOT NULL,
                last_full_sync_at TEXT,
                retry_ids TEXT NOT NULL DEFAULT '[]'
            );
            "#,
        ),
        // 2: offline outbox
        M::up(
            r#"
            CREATE TABLE outbox (
                id TEXT PRIMARY KEY,
                account_id INTEGER NOT NULL,
                to_json TEXT NOT NULL,
                cc_json TEXT NOT NULL DEFAULT '[]',
                bcc_json TEXT NOT NULL DEFAULT '[]',
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                html_body TEXT,
                attachments_json TEXT NOT NULL DEFAULT '[]',
                thread_id TEXT,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX idx_outbox_created_at ON outbox(created_at ASC);
            "#,
        ),
        // 3: background work bookkeeping
        M::up(
            r#"
            CREATE TABLE event_log (
                namespace TEXT NOT NULL,
                at_ms INTEGER NOT NULL
            );

            CREATE INDEX idx_event_log ON event_log(namespace, at_ms);

            CREATE TABLE seen_ids (
                namespace TEXT NOT NULL,
                id TEXT NOT NULL,
                seen_at_ms INTEGER NOT NULL,
                PRIMARY KEY (namespace, id)
            );

            CREATE TABLE summaries (
                account_id INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (account_id, message_id)
            );
            "#,
        ),
    ])
}

pub struct SqliteMailStore {
    conn: Mutex<Connection>,
}

impl SqliteMailStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets the UI read while a background window writes; NORMAL
        // sync is safe under WAL. Foreign keys drive label cascades.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_email(tx: &Transaction<'_>, email: &Email) -> Result<()> {
        tx.execute(
            "INSERT INTO emails
                (account_id, id, thread_id, from_name, from_email, to_json, subject, snippet,
                 received_at, internal_date, has_list_unsubscribe)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id, id) DO UPDATE SET
                thread_id = excluded.thread_id,
                from_name = excluded.from_name,
                from_email = excluded.from_email,
                to_json = excluded.to_json,
                subject = excluded.subject,
                snippet = excluded.snippet,
                received_at = excluded.received_at,
                internal_date = excluded.internal_date,
                has_list_unsubscribe = excluded.has_list_unsubscribe",
            params![
                email.account_id,
                email.id.as_str(),
                email.thread_id.as_str(),
                email.from.name,
                email.from.email,
                serde_json::to_string(&email.to)?,
                email.subject,
                email.snippet,
                email.received_at.to_rfc3339(),
                email.internal_date,
                email.has_list_unsubscribe,
            ],
        )?;
        Self::write_labels(tx, email.account_id, &email.id, &email.label_ids)
    }

    fn write_labels(
        tx: &Transaction<'_>,
        account_id: i64,
        id: &MessageId,
        label_ids: &[String],
    ) -> Result<()> {
        tx.execute(
            "DELETE FROM email_labels WHERE account_id = ? AND message_id = ?",
            params![account_id, id.as_str()],
        )?;
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO email_labels (account_id, message_id, label_id) VALUES (?, ?, ?)",
        )?;
        for label in label_ids {
            stmt.execute(params![account_id, id.as_str(), label])?;
        }
        Ok(())
    }

    fn load_labels(conn: &Connection, account_id: i64, id: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare_cached(
            "SELECT label_id FROM email_labels WHERE account_id = ? AND message_id = ?
             ORDER BY rowid",
        )?;
        let labels = stmt
            .query_map(params![account_id, id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(labels)
    }

    fn load_emails(conn: &Connection, sql: &str, values: Vec<Value>) -> Result<Vec<Email>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), EmailRow::from_row)?
            .collect::<rusqlite::Result<Vec<EmailRow>>>()?;

        rows.into_iter()
            .map(|row| {
                let labels = Self::load_labels(conn, row.account_id, &row.id)?;
                row.into_email(labels)
            })
            .collect()
    }
}

const EMAIL_COLUMNS: &str = "account_id, id, thread_id, from_name, from_email, to_json, subject, \
                             snippet, received_at, internal_date, has_list_unsubscribe";

struct EmailRow {
    account_id: i64,
    id: String,
    thread_id: String,
    from_name: Option<String>,
    from_email: String,
    to_json: String,
    subject: String,
    snippet: String,
    received_at: String,
    internal_date: i64,
    has_list_unsubscribe: bool,
}

impl EmailRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            account_id: row.get(0)?,
            id: row.get(1)?,
            thread_id: row.get(2)?,
            from_name: row.get(3)?,
            from_email: row.get(4)?,
            to_json: row.get(5)?,
            subject: row.get(6)?,
            snippet: row.get(7)?,
            received_at: row.get(8)?,
            internal_date: row.get(9)?,
            has_list_unsubscribe: row.get(10)?,
        })
    }

    fn into_email(self, label_ids: Vec<String>) -> Result<Email> {
        Ok(Email {
            id: MessageId::new(self.id),
            thread_id: ThreadId::new(self.thread_id),
            account_id: self.account_id,
            from: EmailAddress {
                name: self.from_name,
                email: self.from_email,
            },
            to: serde_json::from_str(&self.to_json).context("Corrupt recipient list")?,
            subject: self.subject,
            snippet: self.snippet,
            received_at: parse_time(&self.received_at)?,
            internal_date: self.internal_date,
            label_ids,
            has_list_unsubscribe: self.has_list_unsubscribe,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: {}", s))?
        .with_timezone(&Utc))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl MailStore for SqliteMailStore {
    fn upsert_email(&self, email: Email) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        Self::write_email(&tx, &email)?;
        tx.commit()?;
        Ok(())
    }

    fn apply_changes(
        &self,
        account_id: i64,
        upserts: &[Email],
        deletions: &[MessageId],
    ) -> Result<()> {
        if let Some(stray) = upserts.iter().find(|e| e.account_id != account_id) {
            anyhow::bail!(
                "Email {} belongs to account {}, not {}",
                stray.id,
                stray.account_id,
                account_id
            );
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for email in upserts {
            Self::write_email(&tx, email)?;
        }
        for id in deletions {
            tx.execute(
                "DELETE FROM emails WHERE account_id = ? AND id = ?",
                params![account_id, id.as_str()],
            )?;
        }
        tx.commit()?;

        debug!(
            "[STORE] account {}: applied {} upserts, {} deletions",
            account_id,
            upserts.len(),
            deletions.len()
        );
        Ok(())
    }

    fn get_email(&self, account_id: i64, id: &MessageId) -> Result<Option<Email>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM emails WHERE account_id = ? AND id = ?",
            EMAIL_COLUMNS
        );
        let emails = Self::load_emails(
            &conn,
            &sql,
            vec![Value::Integer(account_id), Value::Text(id.0.clone())],
        )?;
        Ok(emails.into_iter().next())
    }

    fn has_email(&self, account_id: i64, id: &MessageId) -> Result<bool> {
        let conn = self.conn();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM emails WHERE account_id = ? AND id = ?)",
            params![account_id, id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn delete_email(&self, account_id: i64, id: &MessageId) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM emails WHERE account_id = ? AND id = ?",
            params![account_id, id.as_str()],
        )?;
        Ok(())
    }

    fn list_emails(&self, query: &EmailQuery) -> Result<Vec<Email>> {
        let mut sql = format!("SELECT {} FROM emails e WHERE 1 = 1", EMAIL_COLUMNS);
        let mut values = Vec::new();

        if let Some(account_id) = query.account_id {
            sql.push_str(" AND e.account_id = ?");
            values.push(Value::Integer(account_id));
        }
        if let Some(label) = &query.label {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM email_labels l
                   WHERE l.account_id = e.account_id AND l.message_id = e.id AND l.label_id = ?)",
            );
            values.push(Value::Text(label.clone()));
        }
        if query.unread_only {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM email_labels u
                   WHERE u.account_id = e.account_id AND u.message_id = e.id AND u.label_id = ?)",
            );
            values.push(Value::Text(labels::UNREAD.to_string()));
        }
        sql.push_str(" ORDER BY e.internal_date DESC, e.id ASC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        let conn = self.conn();
        Self::load_emails(&conn, &sql, values)
    }

    fn count_emails(&self, account_id: i64) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM emails WHERE account_id = ?",
            [account_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn update_labels(&self, account_id: i64, id: &MessageId, label_ids: Vec<String>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM emails WHERE account_id = ? AND id = ?)",
            params![account_id, id.as_str()],
            |row| row.get(0),
        )?;
        if exists {
            Self::write_labels(&tx, account_id, id, &label_ids)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_sync_state(&self, account_id: i64) -> Result<Option<SyncState>> {
        let conn = self.conn();
        let row: Option<(String, String, Option<String>, String)> = conn
            .query_row(
                "SELECT cursor, last_sync_at, last_full_sync_at, retry_ids
                 FROM sync_state WHERE account_id = ?",
                [account_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((cursor, last_sync_at, last_full_sync_at, retry_ids)) = row else {
            return Ok(None);
        };

        Ok(Some(SyncState {
            account_id,
            cursor: HistoryCursor::new(cursor),
            last_sync_at: parse_time(&last_sync_at)?,
            last_full_sync_at: last_full_sync_at.as_deref().map(parse_time).transpose()?,
            retry_ids: serde_json::from_str(&retry_ids).unwrap_or_default(),
        }))
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO sync_state
                (account_id, cursor, last_sync_at, last_full_sync_at, retry_ids)
             VALUES (?, ?, ?, ?, ?)",
            params![
                state.account_id,
                state.cursor.as_str(),
                state.last_sync_at.to_rfc3339(),
                state.last_full_sync_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&state.retry_ids)?,
            ],
        )?;
        Ok(())
    }

    fn delete_sync_state(&self, account_id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM sync_state WHERE account_id = ?", [account_id])?;
        Ok(())
    }

    fn delete_account_data(&self, account_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM emails WHERE account_id = ?", [account_id])?;
        tx.execute("DELETE FROM summaries WHERE account_id = ?", [account_id])?;
        tx.execute("DELETE FROM sync_state WHERE account_id = ?", [account_id])?;
        tx.commit()?;
        Ok(())
    }
}

const OUTBOX_COLUMNS: &str = "id, account_id, to_json, cc_json, bcc_json, subject, body, \
                              html_body, attachments_json, thread_id, status, retry_count, \
                              last_error, created_at";

struct OutboxRow {
    id: String,
    account_id: i64,
    to_json: String,
    cc_json: String,
    bcc_json: String,
    subject: String,
    body: String,
    html_body: Option<String>,
    attachments_json: String,
    thread_id: Option<String>,
    status: String,
    retry_count: u32,
    last_error: Option<String>,
    created_at: String,
}

impl OutboxRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            to_json: row.get(2)?,
            cc_json: row.get(3)?,
            bcc_json: row.get(4)?,
            subject: row.get(5)?,
            body: row.get(6)?,
            html_body: row.get(7)?,
            attachments_json: row.get(8)?,
            thread_id: row.get(9)?,
            status: row.get(10)?,
            retry_count: row.get(11)?,
            last_error: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    fn into_item(self) -> Result<QueuedOutboundEmail> {
        Ok(QueuedOutboundEmail {
            id: Uuid::parse_str(&self.id).context("Invalid outbox id")?,
            account_id: self.account_id,
            to: serde_json::from_str(&self.to_json)?,
            cc: serde_json::from_str(&self.cc_json)?,
            bcc: serde_json::from_str(&self.bcc_json)?,
            subject: self.subject,
            body: self.body,
            html_body: self.html_body,
            attachments: serde_json::from_str(&self.attachments_json)?,
            thread_id: self.thread_id,
            status: self.status.parse::<OutboxStatus>()?,
            retry_count: self.retry_count,
            last_error: self.last_error,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

impl SqliteMailStore {
    fn query_outbox(&self, sql: &str, values: Vec<Value>) -> Result<Vec<QueuedOutboundEmail>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), OutboxRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(OutboxRow::into_item).collect()
    }
}

impl OutboxStore for SqliteMailStore {
    fn insert_outbox(&self, item: &QueuedOutboundEmail) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO outbox ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                OUTBOX_COLUMNS
            ),
            params![
                item.id.to_string(),
                item.account_id,
                serde_json::to_string(&item.to)?,
                serde_json::to_string(&item.cc)?,
                serde_json::to_string(&item.bcc)?,
                item.subject,
                item.body,
                item.html_body,
                serde_json::to_string(&item.attachments)?,
                item.thread_id,
                item.status.as_str(),
                item.retry_count,
                item.last_error,
                item.created_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to insert outbox item {}", item.id))?;
        Ok(())
    }

    fn update_outbox(&self, item: &QueuedOutboundEmail) -> Result<()> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE outbox SET status = ?, retry_count = ?, last_error = ? WHERE id = ?",
            params![
                item.status.as_str(),
                item.retry_count,
                item.last_error,
                item.id.to_string(),
            ],
        )?;
        if updated == 0 {
            anyhow::bail!("Outbox item {} not found", item.id);
        }
        Ok(())
    }

    fn get_outbox(&self, id: &Uuid) -> Result<Option<QueuedOutboundEmail>> {
        let sql = format!("SELECT {} FROM outbox WHERE id = ?", OUTBOX_COLUMNS);
        Ok(self
            .query_outbox(&sql, vec![Value::Text(id.to_string())])?
            .into_iter()
            .next())
    }

    fn list_outbox(&self) -> Result<Vec<QueuedOutboundEmail>> {
        let sql = format!("SELECT {} FROM outbox ORDER BY created_at ASC, id ASC", OUTBOX_COLUMNS);
        self.query_outbox(&sql, Vec::new())
    }

    fn delete_outbox(&self, id: &Uuid) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM outbox WHERE id = ?", [id.to_string()])?;
        Ok(deleted > 0)
    }
}

impl TimestampLog for SqliteMailStore {
    fn record(&self, namespace: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO event_log (namespace, at_ms) VALUES (?, ?)",
            params![namespace, at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn count_since(&self, namespace: &str, since: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE namespace = ? AND at_ms >= ?",
            params![namespace, since.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn prune_before(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM event_log WHERE namespace = ? AND at_ms < ?",
            params![namespace, before.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

impl SeenIdStore for SqliteMailStore {
    fn mark_seen(&self, namespace: &str, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO seen_ids (namespace, id, seen_at_ms) VALUES (?, ?, ?)",
            params![namespace, id, at.timestamp_millis()],
        )?;
        Ok(inserted > 0)
    }

    fn is_seen(&self, namespace: &str, id: &str) -> Result<bool> {
        let conn = self.conn();
        let seen: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM seen_ids WHERE namespace = ? AND id = ?)",
            params![namespace, id],
            |row| row.get(0),
        )?;
        Ok(seen)
    }

    fn prune_seen(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM seen_ids WHERE namespace = ? AND seen_at_ms < ?",
            params![namespace, before.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

impl SummaryStore for SqliteMailStore {
    fn save_summary(&self, account_id: i64, id: &MessageId, summary: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO summaries (account_id, message_id, summary, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account_id, message_id) DO UPDATE SET
                summary = excluded.summary,
                created_at = excluded.created_at",
            params![account_id, id.as_str(), summary, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn get_summary(&self, account_id: i64, id: &MessageId) -> Result<Option<String>> {
        let conn = self.conn();
        let summary = conn
            .query_row(
                "SELECT summary FROM summaries WHERE account_id = ? AND message_id = ?",
                params![account_id, id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(summary)
    }
}

impl SqliteMailStore {
    /// Oldest recorded event, for diagnostics.
    pub fn oldest_event(&self, namespace: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let ms: Option<i64> = conn.query_row(
            "SELECT MIN(at_ms) FROM event_log WHERE namespace = ?",
            [namespace],
            |row| row.get(0),
        )?;
        Ok(ms.map(from_millis))
    }
}
