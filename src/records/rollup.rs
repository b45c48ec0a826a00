//! Building longer records from shorter ones.

use super::aggregate::{average_container_stats, average_system_stats};
use crate::db::{DbError, Host, RecordKind, RecordTier, StatsRecord, Store};
use crate::stats::{ContainerStats, SystemStats};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Build every complete window of every aggregated tier for every host.
/// Returns the number of system records written.
pub fn create_longer_records(
    store: &Store,
    now: DateTime<Utc>,
    settle: ChronoDuration,
) -> Result<usize, DbError> {
    let mut written = 0;
    for host in store.get_hosts()? {
        // Shorter tiers first so each longer tier sees fresh input.
        for tier in RecordTier::ALL.into_iter().skip(1) {
            match process_host_tier(store, &host, tier, now, settle) {
                Ok(n) => written += n,
                Err(e) => tracing::error!(
                    "RecordManager: rollup of {} (tier {}) failed: {}",
                    host.name,
                    tier.as_str(),
                    e
                ),
            }
        }
    }
    Ok(written)
}

/// Advance one host's tier through all windows that have fully passed.
///
/// The cursor is the newest row already in the tier; without one, the
/// walk starts at the earliest source row truncated to the window. Windows
/// are upserted, so re-running over the same windows rewrites the same rows.
pub fn process_host_tier(
    store: &Store,
    host: &Host,
    tier: RecordTier,
    now: DateTime<Utc>,
    settle: ChronoDuration,
) -> Result<usize, DbError> {
    let Some(source) = tier.source() else {
        return Ok(0);
    };
    let window = ChronoDuration::seconds(tier.window_seconds());

    let mut start = match store.get_last_record_time(host.id, RecordKind::System, tier)? {
        Some(last) => last + window,
        None => match store.get_earliest_record_time(host.id, RecordKind::System, source)? {
            Some(earliest) => truncate_to_window(earliest, tier.window_seconds()),
            None => return Ok(0),
        },
    };

    // Nothing older than the source's retention can still be in the store.
    let horizon = truncate_to_window(now - source.default_retention(), tier.window_seconds());
    if start < horizon {
        start = horizon;
    }

    let cutoff = now - settle;
    let mut system_rows = Vec::new();
    let mut container_rows = Vec::new();

    loop {
        let end = start + window;
        if end > cutoff {
            break;
        }

        if let Some((system, containers)) = aggregate_window(store, host, source, tier, start, end)? {
            system_rows.push(system);
            container_rows.extend(containers);
        }
        start = end;
    }

    if system_rows.is_empty() {
        return Ok(0);
    }

    store.upsert_records(RecordKind::System, &system_rows)?;
    store.upsert_records(RecordKind::Container, &container_rows)?;
    tracing::debug!(
        "RecordManager: saved {} {} records for {}",
        system_rows.len(),
        tier.as_str(),
        host.name
    );
    Ok(system_rows.len())
}

fn aggregate_window(
    store: &Store,
    host: &Host,
    source: RecordTier,
    tier: RecordTier,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Option<(StatsRecord, Option<StatsRecord>)>, DbError> {
    let system_rows = store.get_records(host.id, RecordKind::System, source, start, end)?;
    if system_rows.is_empty() {
        return Ok(None);
    }

    let stats: Vec<SystemStats> = system_rows
        .iter()
        .filter_map(|r| match serde_json::from_str(&r.payload) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!("RecordManager: skipping unreadable record of {}: {}", host.name, e);
                None
            }
        })
        .collect();
    if stats.is_empty() {
        return Ok(None);
    }

    let system = StatsRecord {
        host_id: host.id,
        tier,
        time: start,
        payload: serde_json::to_string(&average_system_stats(&stats))?,
    };

    let container_rows = store.get_records(host.id, RecordKind::Container, source, start, end)?;
    let containers: Vec<Vec<ContainerStats>> = container_rows
        .iter()
        .filter_map(|r| serde_json::from_str(&r.payload).ok())
        .collect();
    let container = if containers.is_empty() {
        None
    } else {
        Some(StatsRecord {
            host_id: host.id,
            tier,
            time: start,
            payload: serde_json::to_string(&average_container_stats(&containers))?,
        })
    };

    tracing::debug!(
        "RecordManager: aggregated {} (tier {}) at {}: {} rows",
        host.name,
        tier.as_str(),
        start.format("%H:%M:%S"),
        stats.len()
    );

    Ok(Some((system, container)))
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    if window_seconds <= 0 {
        return dt;
    }
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}
