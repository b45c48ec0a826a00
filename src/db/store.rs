//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::stats::SystemInfo;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
    #[error("{0}")]
    InUse(String),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(|e| DbError::Migration(format!("pragma setup failed: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves SQLite itself consistent.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Hosts ---

    /// Add a new host and return its ID.
    pub fn add_host(&self, host: &mut Host) -> Result<i64, DbError> {
        if host.port == 0 {
            host.port = DEFAULT_AGENT_PORT;
        }

        let conn = self.lock();
        conn.execute(
            "INSERT INTO hosts (name, address, port, status, fingerprint, last_seen, info) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                host.name,
                host.address,
                host.port,
                host.status.as_str(),
                host.fingerprint,
                host.last_seen.map(format_db_time),
                serde_json::to_string(&host.info)?,
            ],
        )?;
        let id = conn.last_insert_rowid();
        host.id = id;
        Ok(id)
    }

    /// Update a host's identity fields (name, address, port).
    pub fn update_host(&self, host: &Host) -> Result<(), DbError> {
        let conn = self.lock();
        let port = if host.port == 0 { DEFAULT_AGENT_PORT } else { host.port };
        let changed = conn.execute(
            "UPDATE hosts SET name=?1, address=?2, port=?3 WHERE id=?4",
            params![host.name, host.address, port, host.id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all hosts.
    pub fn get_hosts(&self) -> Result<Vec<Host>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, address, port, status, fingerprint, last_seen, info FROM hosts ORDER BY id",
        )?;
        let hosts = stmt
            .query_map([], host_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(hosts)
    }

    /// Get a host by ID.
    pub fn get_host(&self, id: i64) -> Result<Host, DbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, address, port, status, fingerprint, last_seen, info FROM hosts WHERE id = ?1",
            params![id],
            host_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get a host by its unique name.
    pub fn get_host_by_name(&self, name: &str) -> Result<Option<Host>, DbError> {
        let conn = self.lock();
        let host = conn
            .query_row(
                "SELECT id, name, address, port, status, fingerprint, last_seen, info FROM hosts WHERE name = ?1",
                params![name],
                host_from_row,
            )
            .optional()?;
        Ok(host)
    }

    /// Set a host's connectivity status.
    pub fn set_host_status(&self, id: i64, status: HostStatus) -> Result<(), DbError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE hosts SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Record the outcome of a successful poll.
    pub fn record_host_seen(
        &self,
        id: i64,
        info: &SystemInfo,
        fingerprint: &str,
        seen: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE hosts SET info = ?1, fingerprint = ?2, last_seen = ?3 WHERE id = ?4",
            params![serde_json::to_string(info)?, fingerprint, format_db_time(seen), id],
        )?;
        Ok(())
    }

    /// Delete a host and its records. Refused while alert rules reference it.
    pub fn delete_host(&self, id: i64) -> Result<(), DbError> {
        let conn = self.lock();
        let rules: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alert_rules WHERE host_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if rules > 0 {
            return Err(DbError::InUse(format!(
                "host {} is referenced by {} alert rule(s)",
                id, rules
            )));
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM system_stats WHERE host_id = ?1", params![id])?;
        tx.execute("DELETE FROM container_stats WHERE host_id = ?1", params![id])?;
        tx.execute("DELETE FROM host_users WHERE host_id = ?1", params![id])?;
        tx.execute("DELETE FROM hosts WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // --- Users ---

    /// Add a new user and return its ID.
    pub fn add_user(&self, user: &mut User) -> Result<i64, DbError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO users (email, webhooks) VALUES (?1, ?2)",
            params![user.email, serde_json::to_string(&user.webhooks)?],
        )?;
        user.id = conn.last_insert_rowid();
        Ok(user.id)
    }

    /// Get a user by ID.
    pub fn get_user(&self, id: i64) -> Result<User, DbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, email, webhooks FROM users WHERE id = ?1",
            params![id],
            user_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get a user by email.
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DbError> {
        let conn = self.lock();
        let user = conn
            .query_row(
                "SELECT id, email, webhooks FROM users WHERE email = ?1",
                params![email],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Give a user access to a host.
    pub fn link_user(&self, host_id: i64, user_id: i64) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO host_users (host_id, user_id) VALUES (?1, ?2)",
            params![host_id, user_id],
        )?;
        Ok(())
    }

    /// Get the users linked to a host.
    pub fn get_host_users(&self, host_id: i64) -> Result<Vec<User>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT u.id, u.email, u.webhooks FROM users u
             JOIN host_users hu ON hu.user_id = u.id
             WHERE hu.host_id = ?1 ORDER BY u.id",
        )?;
        let users = stmt
            .query_map(params![host_id], user_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(users)
    }

    // --- Alert rules ---

    /// Add a new alert rule and return its ID.
    pub fn add_alert_rule(&self, rule: &mut AlertRule) -> Result<i64, DbError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO alert_rules (host_id, user_id, name, min_minutes) VALUES (?1, ?2, ?3, ?4)",
            params![rule.host_id, rule.user_id, rule.name, rule.min_minutes],
        )?;
        rule.id = conn.last_insert_rowid();
        Ok(rule.id)
    }

    /// Get the connectivity ("Status") alert rules for a host.
    pub fn get_status_alert_rules(&self, host_id: i64) -> Result<Vec<AlertRule>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, host_id, user_id, name, min_minutes FROM alert_rules
             WHERE host_id = ?1 AND name = 'Status' ORDER BY id",
        )?;
        let rules = stmt
            .query_map(params![host_id], |row| {
                Ok(AlertRule {
                    id: row.get(0)?,
                    host_id: row.get(1)?,
                    user_id: row.get(2)?,
                    name: row.get(3)?,
                    min_minutes: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rules)
    }

    /// Delete an alert rule.
    pub fn delete_alert_rule(&self, id: i64) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute("DELETE FROM alert_rules WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Stats records ---

    /// Insert records in batch, replacing any row with the same
    /// (host, tier, time) key.
    pub fn upsert_records(&self, kind: RecordKind, records: &[StatsRecord]) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }

        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (host_id, tier, time, payload) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(host_id, tier, time) DO UPDATE SET payload = excluded.payload",
                kind.table()
            ))?;

            for r in records {
                stmt.execute(params![
                    r.host_id,
                    r.tier.as_str(),
                    format_db_time(r.time),
                    r.payload,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get records for a host and tier within `[start, end)`.
    pub fn get_records(
        &self,
        host_id: i64,
        kind: RecordKind,
        tier: RecordTier,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StatsRecord>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT host_id, time, payload FROM {}
             WHERE host_id = ?1 AND tier = ?2 AND time >= ?3 AND time < ?4 ORDER BY time ASC",
            kind.table()
        ))?;

        let records = stmt
            .query_map(
                params![host_id, tier.as_str(), format_db_time(start), format_db_time(end)],
                |row| {
                    let time_str: String = row.get(1)?;
                    let time = parse_db_time(&time_str).unwrap_or_else(Utc::now);
                    Ok(StatsRecord {
                        host_id: row.get(0)?,
                        tier,
                        time,
                        payload: row.get(2)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Number of records for a host and tier.
    pub fn count_records(&self, host_id: i64, kind: RecordKind, tier: RecordTier) -> Result<i64, DbError> {
        let conn = self.lock();
        Ok(conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE host_id = ?1 AND tier = ?2", kind.table()),
            params![host_id, tier.as_str()],
            |row| row.get(0),
        )?)
    }

    /// Time of the newest record in a tier, i.e. the start of the last
    /// aggregated window for aggregated tiers.
    pub fn get_last_record_time(
        &self,
        host_id: i64,
        kind: RecordKind,
        tier: RecordTier,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        self.record_time_bound("MAX", host_id, kind, tier)
    }

    /// Time of the oldest record in a tier.
    pub fn get_earliest_record_time(
        &self,
        host_id: i64,
        kind: RecordKind,
        tier: RecordTier,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        self.record_time_bound("MIN", host_id, kind, tier)
    }

    fn record_time_bound(
        &self,
        func: &str,
        host_id: i64,
        kind: RecordKind,
        tier: RecordTier,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.lock();
        let result: Option<String> = conn.query_row(
            &format!(
                "SELECT {}(time) FROM {} WHERE host_id = ?1 AND tier = ?2",
                func,
                kind.table()
            ),
            params![host_id, tier.as_str()],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Delete all records of a tier older than the cutoff. Returns the
    /// number of rows removed.
    pub fn delete_records_before(
        &self,
        kind: RecordKind,
        tier: RecordTier,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.lock();
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE tier = ?1 AND time < ?2", kind.table()),
            params![tier.as_str(), format_db_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

fn host_from_row(row: &Row<'_>) -> SqlResult<Host> {
    let status: String = row.get(4)?;
    let last_seen: Option<String> = row.get(6)?;
    let info: String = row.get(7)?;
    Ok(Host {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        port: row.get(3)?,
        status: status.parse().unwrap_or(HostStatus::Pending),
        fingerprint: row.get(5)?,
        last_seen: last_seen.as_deref().and_then(parse_db_time),
        info: serde_json::from_str(&info).unwrap_or_default(),
    })
}

fn user_from_row(row: &Row<'_>) -> SqlResult<User> {
    let webhooks: String = row.get(2)?;
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        webhooks: serde_json::from_str(&webhooks).unwrap_or_default(),
    })
}

fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    fn new_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_host_crud() {
        let (_tmp, store) = new_store();

        let mut host = Host {
            name: "web-1".to_string(),
            address: "10.0.0.2".to_string(),
            ..Default::default()
        };
        let id = store.add_host(&mut host).unwrap();
        assert!(id > 0);

        let fetched = store.get_host(id).unwrap();
        assert_eq!(fetched.name, "web-1");
        assert_eq!(fetched.status, HostStatus::Pending);
        assert!(fetched.last_seen.is_none());

        store.set_host_status(id, HostStatus::Up).unwrap();
        let info = SystemInfo {
            hostname: "web-1.local".to_string(),
            ..Default::default()
        };
        store.record_host_seen(id, &info, "abc", Utc::now()).unwrap();

        let fetched = store.get_host_by_name("web-1").unwrap().unwrap();
        assert_eq!(fetched.status, HostStatus::Up);
        assert_eq!(fetched.fingerprint, "abc");
        assert_eq!(fetched.info.hostname, "web-1.local");
        assert!(fetched.last_seen.is_some());

        store.delete_host(id).unwrap();
        assert!(matches!(store.get_host(id), Err(DbError::NotFound)));
    }

    #[test]
    fn test_host_with_rules_is_not_deleted() {
        let (_tmp, store) = new_store();

        let mut host = Host {
            name: "db-1".to_string(),
            address: "10.0.0.3".to_string(),
            ..Default::default()
        };
        store.add_host(&mut host).unwrap();
        let mut user = User {
            email: "ops@example.com".to_string(),
            ..Default::default()
        };
        store.add_user(&mut user).unwrap();
        let mut rule = AlertRule {
            host_id: host.id,
            user_id: user.id,
            min_minutes: 5,
            ..Default::default()
        };
        store.add_alert_rule(&mut rule).unwrap();

        assert!(matches!(store.delete_host(host.id), Err(DbError::InUse(_))));

        let rules = store.get_status_alert_rules(host.id).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].min_minutes, 5);

        store.delete_alert_rule(rule.id).unwrap();
        store.delete_host(host.id).unwrap();
    }

    #[test]
    fn test_record_upsert_is_keyed() {
        let (_tmp, store) = new_store();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let rec = |payload: &str| StatsRecord {
            host_id: 1,
            tier: RecordTier::TenMinutes,
            time: t,
            payload: payload.to_string(),
        };

        store.upsert_records(RecordKind::System, &[rec("{\"cpu\":1.0}")]).unwrap();
        store.upsert_records(RecordKind::System, &[rec("{\"cpu\":2.0}")]).unwrap();

        assert_eq!(store.count_records(1, RecordKind::System, RecordTier::TenMinutes).unwrap(), 1);
        let rows = store
            .get_records(1, RecordKind::System, RecordTier::TenMinutes, t, t + ChronoDuration::minutes(10))
            .unwrap();
        assert_eq!(rows[0].payload, "{\"cpu\":2.0}");
        assert_eq!(
            store.get_last_record_time(1, RecordKind::System, RecordTier::TenMinutes).unwrap(),
            Some(t)
        );
    }

    #[test]
    fn test_host_users() {
        let (_tmp, store) = new_store();
        let mut host = Host {
            name: "cache".to_string(),
            address: "cache.internal".to_string(),
            ..Default::default()
        };
        store.add_host(&mut host).unwrap();
        let mut user = User {
            email: "a@example.com".to_string(),
            webhooks: vec!["http://hooks.local/a".to_string()],
            ..Default::default()
        };
        store.add_user(&mut user).unwrap();
        store.link_user(host.id, user.id).unwrap();
        store.link_user(host.id, user.id).unwrap();

        let users = store.get_host_users(host.id).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].webhooks, vec!["http://hooks.local/a".to_string()]);
        assert_eq!(store.get_user_by_email("a@example.com").unwrap().unwrap().id, user.id);
    }
}
