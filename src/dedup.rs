use std::collections::HashSet;

use tracing::instrument;

use crate::db::Db;
use crate::error::IngestError;
use crate::record::RawRecord;

/// Fixed snapshot of the keys already present in raw storage, taken once per
/// run. Concurrent writers can land the same key mid-run; insert-if-absent
/// write semantics absorb that race downstream, so the snapshot is never
/// re-queried per record.
#[derive(Debug, Default)]
pub struct KeySnapshot {
    keys: HashSet<String>,
}

impl KeySnapshot {
    #[instrument(skip(db))]
    pub async fn load(db: &Db) -> Result<Self, IngestError> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT firebase_key FROM raw_games")
            .persistent(false)
            .fetch_all(&db.pool)
            .await?;
        Ok(Self {
            keys: keys.into_iter().collect(),
        })
    }

    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Split a candidate batch into records absent from the snapshot and a
    /// count of the ones already present.
    pub fn filter_new(&self, batch: Vec<RawRecord>) -> (Vec<RawRecord>, usize) {
        let before = batch.len();
        let fresh: Vec<RawRecord> = batch
            .into_iter()
            .filter(|rec| !self.contains(&rec.key))
            .collect();
        let skipped = before - fresh.len();
        (fresh, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn record(key: &str) -> RawRecord {
        RawRecord {
            key: key.to_string(),
            game_json: "{}".to_string(),
            created_at: DateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn present_keys_are_excluded() {
        let snapshot = KeySnapshot::from_keys(["K1", "K3"]);
        let (fresh, skipped) =
            snapshot.filter_new(vec![record("K1"), record("K2"), record("K3"), record("K4")]);
        let keys: Vec<&str> = fresh.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["K2", "K4"]);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn empty_snapshot_passes_everything() {
        let snapshot = KeySnapshot::default();
        assert!(snapshot.is_empty());
        let (fresh, skipped) = snapshot.filter_new(vec![record("K1")]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(skipped, 0);
    }
}
