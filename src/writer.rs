use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::cancel::CancelToken;
use crate::db::Db;
use crate::error::IngestError;

/// A single destination write. Both variants are insert-if-absent: duplicate
/// keys are absorbed by the destination's uniqueness constraints instead of
/// surfacing as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatement {
    RawGame {
        key: String,
        payload: String,
        created_at: DateTime<Utc>,
    },
    PlayerAssociation {
        player_uid: String,
        key: String,
        created_at: DateTime<Utc>,
    },
}

impl WriteStatement {
    /// Short human form for dry-run previews.
    pub fn preview(&self) -> String {
        match self {
            WriteStatement::RawGame { key, payload, .. } => {
                format!("raw_games<{key}> ({} bytes)", payload.len())
            }
            WriteStatement::PlayerAssociation {
                player_uid, key, ..
            } => format!("player_games<{player_uid},{key}>"),
        }
    }
}

pub fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        s.truncate(max_len);
        s.push('…');
    }
    s
}

/// Group statements into ordered chunks not exceeding `batch_size`.
pub fn plan_chunks(statements: Vec<WriteStatement>, batch_size: usize) -> Vec<Vec<WriteStatement>> {
    let size = batch_size.max(1);
    let mut chunks = Vec::with_capacity(statements.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(statements.len()));
    for stmt in statements {
        current.push(stmt);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WriteSummary {
    pub statements: usize,
    pub chunks: usize,
    /// True when cancellation stopped the loop before all chunks applied.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchWriter {
    pub batch_size: usize,
    pub dry_run: bool,
}

impl BatchWriter {
    /// Apply statements in transactional chunks. Each chunk is atomic at the
    /// destination; a chunk failure propagates with prior chunks committed.
    /// Cancellation is honored between chunks, never mid-chunk.
    #[instrument(skip(self, db, statements, cancel), fields(batch_size = self.batch_size))]
    pub async fn apply(
        &self,
        db: &Db,
        statements: Vec<WriteStatement>,
        cancel: &CancelToken,
    ) -> Result<WriteSummary, IngestError> {
        if statements.is_empty() {
            return Ok(WriteSummary::default());
        }
        let chunks = plan_chunks(statements, self.batch_size);

        if self.dry_run {
            let statements: usize = chunks.iter().map(|c| c.len()).sum();
            let preview = truncate_for_log(
                chunks
                    .iter()
                    .flatten()
                    .map(WriteStatement::preview)
                    .collect::<Vec<_>>()
                    .join(", "),
                400,
            );
            info!(
                statements,
                chunks = chunks.len(),
                preview = %preview,
                "dry-run: destination writes skipped"
            );
            return Ok(WriteSummary {
                statements,
                chunks: chunks.len(),
                interrupted: false,
            });
        }

        let mut summary = WriteSummary::default();
        for chunk in chunks {
            if cancel.is_cancelled() {
                summary.interrupted = true;
                return Ok(summary);
            }
            self.apply_chunk(db, &chunk).await?;
            summary.statements += chunk.len();
            summary.chunks += 1;
        }
        Ok(summary)
    }

    async fn apply_chunk(&self, db: &Db, chunk: &[WriteStatement]) -> Result<(), IngestError> {
        let mut tx = db.pool.begin().await?;
        for stmt in chunk {
            match stmt {
                WriteStatement::RawGame {
                    key,
                    payload,
                    created_at,
                } => {
                    sqlx::query(
                        "INSERT INTO raw_games (firebase_key, game_json, created_at)
                         VALUES ($1, $2, $3)
                         ON CONFLICT (firebase_key) DO NOTHING",
                    )
                    .persistent(false)
                    .bind(key)
                    .bind(payload)
                    .bind(created_at)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteStatement::PlayerAssociation {
                    player_uid,
                    key,
                    created_at,
                } => {
                    sqlx::query(
                        "INSERT INTO player_games (player_uid, firebase_key, created_at)
                         VALUES ($1, $2, $3)
                         ON CONFLICT (player_uid, firebase_key) DO NOTHING",
                    )
                    .persistent(false)
                    .bind(player_uid)
                    .bind(key)
                    .bind(created_at)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assoc(uid: &str) -> WriteStatement {
        WriteStatement::PlayerAssociation {
            player_uid: uid.to_string(),
            key: "K".to_string(),
            created_at: DateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn five_statements_at_size_two_make_chunks_of_2_2_1() {
        let stmts: Vec<_> = ["a", "b", "c", "d", "e"].into_iter().map(assoc).collect();
        let chunks = plan_chunks(stmts, 2);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, [2, 2, 1]);
        // Original order preserved across chunk boundaries.
        let flat: Vec<&str> = chunks
            .iter()
            .flatten()
            .map(|s| match s {
                WriteStatement::PlayerAssociation { player_uid, .. } => player_uid.as_str(),
                other => panic!("unexpected statement {other:?}"),
            })
            .collect();
        assert_eq!(flat, ["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        let chunks = plan_chunks(vec![assoc("a"), assoc("b")], 0);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn empty_input_plans_nothing() {
        assert!(plan_chunks(Vec::new(), 10).is_empty());
    }

    #[test]
    fn preview_is_truncated() {
        let long = "x".repeat(500);
        let out = truncate_for_log(long, 40);
        assert!(out.len() <= 40 + '…'.len_utf8());
        assert!(out.ends_with('…'));
    }
}
