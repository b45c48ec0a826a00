//! Deleting records past their tier's retention.

use crate::db::{DbError, RecordKind, RecordTier, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Delete every record older than its tier's horizon. Raw records use
/// `raw_retention`, aggregated tiers their fixed retention. Returns the
/// number of rows removed.
pub fn delete_old_records(
    store: &Store,
    raw_retention: ChronoDuration,
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let mut deleted = 0;

    for tier in RecordTier::ALL {
        let retention = match tier {
            RecordTier::Raw => raw_retention,
            other => other.default_retention(),
        };
        let cutoff = now - retention;

        for kind in [RecordKind::System, RecordKind::Container] {
            let n = store.delete_records_before(kind, tier, cutoff)?;
            if n > 0 {
                tracing::debug!(
                    "RecordManager: deleted {} {} records in tier {}",
                    n,
                    kind.table(),
                    tier.as_str()
                );
            }
            deleted += n;
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StatsRecord;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    #[test]
    fn test_no_raw_record_survives_past_horizon() {
        let file = NamedTempFile::new().unwrap();
        let store = Store::new(file.path()).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let records: Vec<StatsRecord> = (0..120)
            .map(|m| StatsRecord {
                host_id: 1,
                tier: RecordTier::Raw,
                time: now - ChronoDuration::minutes(m),
                payload: "{}".to_string(),
            })
            .collect();
        store.upsert_records(RecordKind::System, &records).unwrap();

        let aggregated = StatsRecord {
            host_id: 1,
            tier: RecordTier::TenMinutes,
            time: now - ChronoDuration::hours(2),
            payload: "{}".to_string(),
        };
        store
            .upsert_records(RecordKind::System, std::slice::from_ref(&aggregated))
            .unwrap();

        let deleted = delete_old_records(&store, ChronoDuration::hours(1), now).unwrap();
        assert_eq!(deleted, 59);

        let earliest = store
            .get_earliest_record_time(1, RecordKind::System, RecordTier::Raw)
            .unwrap()
            .unwrap();
        assert!(earliest >= now - ChronoDuration::hours(1));

        // Aggregated rows follow their own, longer retention.
        assert_eq!(
            store
                .count_records(1, RecordKind::System, RecordTier::TenMinutes)
                .unwrap(),
            1
        );

        // A second pass has nothing left to do.
        assert_eq!(delete_old_records(&store, ChronoDuration::hours(1), now).unwrap(), 0);
    }
}
