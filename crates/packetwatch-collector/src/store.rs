// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SQLite-backed persistence for agents, traffic logs and blacklist alerts.
//!
//! All writes for one datagram happen in a single transaction so a failure
//! rolls the whole record back. Timestamps are stored as RFC 3339 strings
//! with a fixed precision, which keeps lexicographic comparison equivalent
//! to chronological comparison for the timeframe filters.

use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use packetwatch_wire::TelemetryRecord;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;

use crate::detect::Verdict;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address TEXT NOT NULL UNIQUE,
    name TEXT,
    mac_address TEXT
);

CREATE TABLE IF NOT EXISTS traffic_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id INTEGER NOT NULL REFERENCES agents (id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    direction TEXT NOT NULL,
    destination_ip TEXT NOT NULL,
    port INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    country TEXT NOT NULL,
    software_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS blacklist_alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id INTEGER NOT NULL REFERENCES agents (id) ON DELETE CASCADE,
    destination_ip TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_traffic_agent ON traffic_logs (agent_id);
CREATE INDEX IF NOT EXISTS idx_traffic_timestamp ON traffic_logs (timestamp);
CREATE INDEX IF NOT EXISTS idx_traffic_destination ON traffic_logs (destination_ip);
CREATE INDEX IF NOT EXISTS idx_traffic_country ON traffic_logs (country);
CREATE INDEX IF NOT EXISTS idx_traffic_software ON traffic_logs (software_name);
";

/// Shared filter clause for the stats queries. Passing NULL for a slot
/// disables that filter.
const STATS_FILTER: &str = "(?1 IS NULL OR agent_id = ?1) AND (?2 IS NULL OR timestamp >= ?2)";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Opening or initializing the database file failed.
    #[error("failed to open database: {0}")]
    Open(#[source] rusqlite::Error),
    /// A query or write failed.
    #[error("database operation failed: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// One registered capture agent, in the shape the agents endpoint returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRow {
    pub id: i64,
    pub name: Option<String>,
    pub ip: String,
}

/// Grouped row count keyed by a label column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelCount {
    pub label: String,
    pub value: i64,
}

/// Summed transfer volume per process, in megabytes rounded to two places.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelMegabytes {
    pub label: String,
    pub value: f64,
}

/// Row count per process name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessCount {
    pub name: String,
    pub count: i64,
}

/// Aggregations backing the dashboard stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficStats {
    pub countries: Vec<LabelCount>,
    pub softwares: Vec<LabelCount>,
    pub ips: Vec<LabelCount>,
    pub bandwidth: Vec<LabelMegabytes>,
    pub top_processes: Vec<ProcessCount>,
}

/// Owns the SQLite connection. Callers share it behind a mutex so ingest
/// writes and the administrative reset are mutually exclusive.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(StoreError::Open)?;
        Self::init(conn)
    }

    /// Opens a private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::Open)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreError::Open)?;
        conn.execute_batch(SCHEMA).map_err(StoreError::Open)?;
        Ok(Self { conn })
    }

    /// Persists one decoded datagram: upserts the sending agent, inserts the
    /// traffic row and writes any alert rows the verdict calls for, all in a
    /// single transaction. Returns the agent's id.
    pub fn commit_record(
        &mut self,
        source: IpAddr,
        display_name: &str,
        record: &TelemetryRecord,
        verdict: Verdict,
    ) -> Result<i64, StoreError> {
        let tx = self.conn.transaction()?;
        let agent_id = upsert_agent(&tx, source, display_name, &record.mac)?;
        tx.execute(
            "INSERT INTO traffic_logs
                 (agent_id, timestamp, direction, destination_ip, port, size_bytes, country, software_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                agent_id,
                sql_timestamp(record.timestamp),
                record.direction.as_str(),
                record.destination_ip.to_string(),
                record.port,
                i64::try_from(record.size_bytes).unwrap_or(i64::MAX),
                record.country,
                record.software_name,
            ],
        )?;
        if verdict.blacklist_hit {
            insert_alert(&tx, agent_id, &record.destination_ip.to_string())?;
        }
        if verdict.port_scan {
            insert_alert(&tx, agent_id, &format!("PORT SCAN: {}", record.destination_ip))?;
        }
        tx.commit()?;
        Ok(agent_id)
    }

    /// Lists every registered agent.
    pub fn agents(&self) -> Result<Vec<AgentRow>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, ip_address FROM agents ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(AgentRow {
                id: row.get(0)?,
                name: row.get(1)?,
                ip: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Computes the dashboard aggregations, optionally filtered to one agent
    /// and to rows at or after a cutoff.
    pub fn traffic_stats(
        &self,
        agent: Option<i64>,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<TrafficStats, StoreError> {
        let cutoff = cutoff.map(sql_timestamp);

        let countries = self
            .label_counts(
                &format!(
                    "SELECT country, COUNT(id) FROM traffic_logs
                     WHERE {STATS_FILTER} GROUP BY country"
                ),
                agent,
                cutoff.as_deref(),
            )?
            .into_iter()
            .map(|(label, value)| LabelCount { label, value })
            .collect();

        let softwares = self
            .label_counts(
                &format!(
                    "SELECT software_name, COUNT(id) FROM traffic_logs
                     WHERE {STATS_FILTER} GROUP BY software_name"
                ),
                agent,
                cutoff.as_deref(),
            )?
            .into_iter()
            .map(|(label, value)| LabelCount { label, value })
            .collect();

        let ips = self
            .label_counts(
                &format!(
                    "SELECT destination_ip, COUNT(id) FROM traffic_logs
                     WHERE {STATS_FILTER} GROUP BY destination_ip
                     ORDER BY COUNT(id) DESC LIMIT 10"
                ),
                agent,
                cutoff.as_deref(),
            )?
            .into_iter()
            .map(|(label, value)| LabelCount { label, value })
            .collect();

        let bandwidth = self
            .label_counts(
                &format!(
                    "SELECT software_name, SUM(size_bytes) FROM traffic_logs
                     WHERE {STATS_FILTER} GROUP BY software_name
                     ORDER BY SUM(size_bytes) DESC LIMIT 5"
                ),
                agent,
                cutoff.as_deref(),
            )?
            .into_iter()
            .filter(|(_, bytes)| *bytes != 0)
            .map(|(label, bytes)| LabelMegabytes {
                label,
                value: round_megabytes(bytes),
            })
            .collect();

        let top_processes = self
            .label_counts(
                &format!(
                    "SELECT software_name, COUNT(id) FROM traffic_logs
                     WHERE {STATS_FILTER} GROUP BY software_name
                     ORDER BY COUNT(id) DESC LIMIT 10"
                ),
                agent,
                cutoff.as_deref(),
            )?
            .into_iter()
            .map(|(name, count)| ProcessCount { name, count })
            .collect();

        Ok(TrafficStats {
            countries,
            softwares,
            ips,
            bandwidth,
            top_processes,
        })
    }

    /// Empties all three tables and restarts their id sequences.
    pub fn reset(&mut self) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM blacklist_alerts", [])?;
        tx.execute("DELETE FROM traffic_logs", [])?;
        tx.execute("DELETE FROM agents", [])?;
        tx.execute(
            "DELETE FROM sqlite_sequence
             WHERE name IN ('agents', 'traffic_logs', 'blacklist_alerts')",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn raw_connection(&self) -> &Connection {
        &self.conn
    }

    fn label_counts(
        &self,
        sql: &str,
        agent: Option<i64>,
        cutoff: Option<&str>,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![agent, cutoff], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn upsert_agent(
    tx: &Transaction<'_>,
    source: IpAddr,
    display_name: &str,
    mac: &str,
) -> Result<i64, rusqlite::Error> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM agents WHERE ip_address = ?1",
            params![source.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(id) => Ok(id),
        None => {
            tx.execute(
                "INSERT INTO agents (ip_address, name, mac_address) VALUES (?1, ?2, ?3)",
                params![source.to_string(), display_name, mac],
            )?;
            Ok(tx.last_insert_rowid())
        }
    }
}

fn insert_alert(
    tx: &Transaction<'_>,
    agent_id: i64,
    destination: &str,
) -> Result<usize, rusqlite::Error> {
    tx.execute(
        "INSERT INTO blacklist_alerts (agent_id, destination_ip, timestamp) VALUES (?1, ?2, ?3)",
        params![agent_id, destination, sql_timestamp(Utc::now())],
    )
}

/// Fixed-width RFC 3339 rendering so stored values compare lexicographically.
fn sql_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn round_megabytes(bytes: i64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use packetwatch_wire::Direction;
    use std::net::Ipv4Addr;

    const AGENT_A: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 15));
    const AGENT_B: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 16));

    fn record(destination: [u8; 4], port: u16, size: u64, software: &str) -> TelemetryRecord {
        TelemetryRecord {
            timestamp: Utc::now(),
            direction: Direction::Outbound,
            destination_ip: IpAddr::V4(Ipv4Addr::from(destination)),
            port,
            size_bytes: size,
            country: "Unknown".to_string(),
            software_name: software.to_string(),
            mac: "AA:BB:CC:00:11:22".to_string(),
        }
    }

    fn quiet() -> Verdict {
        Verdict::default()
    }

    #[test]
    fn commit_registers_agent_once() {
        let mut store = Store::open_in_memory().unwrap();
        let first = store
            .commit_record(AGENT_A, "Agent_192.168.1.15", &record([1, 1, 1, 1], 80, 100, "curl"), quiet())
            .unwrap();
        let second = store
            .commit_record(AGENT_A, "Agent_192.168.1.15", &record([1, 1, 1, 2], 443, 100, "curl"), quiet())
            .unwrap();
        assert_eq!(first, second);

        let agents = store.agents().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, first);
        assert_eq!(agents[0].name.as_deref(), Some("Agent_192.168.1.15"));
        assert_eq!(agents[0].ip, "192.168.1.15");
    }

    #[test]
    fn stats_group_and_rank() {
        let mut store = Store::open_in_memory().unwrap();
        // Three firefox rows to one address, one curl row to another.
        for _ in 0..3 {
            store
                .commit_record(AGENT_A, "a", &record([8, 8, 8, 8], 443, 1_572_864, "firefox"), quiet())
                .unwrap();
        }
        store
            .commit_record(AGENT_A, "a", &record([1, 1, 1, 1], 80, 524_288, "curl"), quiet())
            .unwrap();

        let stats = store.traffic_stats(None, None).unwrap();
        assert_eq!(
            stats.countries,
            vec![LabelCount {
                label: "Unknown".to_string(),
                value: 4
            }]
        );
        assert_eq!(stats.ips.len(), 2);
        assert_eq!(stats.ips[0].label, "8.8.8.8");
        assert_eq!(stats.ips[0].value, 3);

        // 3 * 1.5 MiB = 4.5, 0.5 MiB rounds to 0.5.
        assert_eq!(stats.bandwidth[0].label, "firefox");
        assert_eq!(stats.bandwidth[0].value, 4.5);
        assert_eq!(stats.bandwidth[1].label, "curl");
        assert_eq!(stats.bandwidth[1].value, 0.5);

        assert_eq!(stats.top_processes[0].name, "firefox");
        assert_eq!(stats.top_processes[0].count, 3);
    }

    #[test]
    fn stats_filter_by_agent_and_cutoff() {
        let mut store = Store::open_in_memory().unwrap();
        let mut old = record([1, 1, 1, 1], 80, 100, "curl");
        old.timestamp = Utc::now() - Duration::hours(2);
        store.commit_record(AGENT_A, "a", &old, quiet()).unwrap();
        let id_b = store
            .commit_record(AGENT_B, "b", &record([2, 2, 2, 2], 443, 100, "wget"), quiet())
            .unwrap();

        let only_b = store.traffic_stats(Some(id_b), None).unwrap();
        assert_eq!(only_b.ips.len(), 1);
        assert_eq!(only_b.ips[0].label, "2.2.2.2");

        let recent = store
            .traffic_stats(None, Some(Utc::now() - Duration::hours(1)))
            .unwrap();
        assert_eq!(recent.ips.len(), 1);
        assert_eq!(recent.ips[0].label, "2.2.2.2");
    }

    #[test]
    fn verdicts_write_alert_rows() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .commit_record(
                AGENT_A,
                "a",
                &record([203, 0, 113, 5], 4444, 60, "nc"),
                Verdict {
                    blacklist_hit: true,
                    port_scan: false,
                },
            )
            .unwrap();
        store
            .commit_record(
                AGENT_A,
                "a",
                &record([10, 0, 0, 40], 1022, 60, "nmap"),
                Verdict {
                    blacklist_hit: false,
                    port_scan: true,
                },
            )
            .unwrap();

        let destinations: Vec<String> = {
            let mut stmt = store
                .conn
                .prepare("SELECT destination_ip FROM blacklist_alerts ORDER BY id")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap()
        };
        assert_eq!(destinations, vec!["203.0.113.5", "PORT SCAN: 10.0.0.40"]);
    }

    #[test]
    fn reset_clears_tables_and_id_sequences() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .commit_record(AGENT_A, "a", &record([1, 1, 1, 1], 80, 100, "curl"), quiet())
            .unwrap();
        store.reset().unwrap();

        assert!(store.agents().unwrap().is_empty());
        let stats = store.traffic_stats(None, None).unwrap();
        assert!(stats.countries.is_empty());
        assert!(stats.top_processes.is_empty());

        // Ids restart from 1 after a reset.
        let id = store
            .commit_record(AGENT_B, "b", &record([2, 2, 2, 2], 443, 100, "wget"), quiet())
            .unwrap();
        assert_eq!(id, 1);
    }
}
