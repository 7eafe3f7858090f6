use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;

use crate::record::RawRecord;
use crate::writer::WriteStatement;

/// Validated view of a game payload: the distinct player uids, in first-seen
/// order. Validation only rejects unparseable JSON; a payload without a
/// usable `players` array is valid and simply carries no uids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GamePayload {
    pub player_uids: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),
}

/// Parse a record's raw payload into a typed result before transformation.
/// Non-string `uid` entries are skipped; duplicates collapse to one.
pub fn validate_payload(raw: &str) -> Result<GamePayload, ValidationError> {
    let v: Value = serde_json::from_str(raw)?;
    let mut player_uids = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    if let Some(players) = v.get("players").and_then(|p| p.as_array()) {
        for entry in players {
            if let Some(uid) = entry.get("uid").and_then(|u| u.as_str()) {
                if seen.insert(uid) {
                    player_uids.push(uid.to_string());
                }
            }
        }
    }
    Ok(GamePayload { player_uids })
}

/// One raw-storage statement plus one association statement per distinct uid.
/// All generated statements are insert-if-absent, so replays and races with
/// concurrent writers are absorbed by the destination's uniqueness constraints.
pub fn transform(record: &RawRecord) -> Result<Vec<WriteStatement>, ValidationError> {
    let payload = validate_payload(&record.game_json)?;
    let mut statements = Vec::with_capacity(1 + payload.player_uids.len());
    statements.push(WriteStatement::RawGame {
        key: record.key.clone(),
        payload: record.game_json.clone(),
        created_at: record.created_at,
    });
    statements.extend(association_statements_for(record, payload));
    Ok(statements)
}

/// Association statements only; used by backfill over rows already in raw
/// storage.
pub fn associations(record: &RawRecord) -> Result<Vec<WriteStatement>, ValidationError> {
    let payload = validate_payload(&record.game_json)?;
    Ok(association_statements_for(record, payload))
}

fn association_statements_for(record: &RawRecord, payload: GamePayload) -> Vec<WriteStatement> {
    payload
        .player_uids
        .into_iter()
        .map(|player_uid| WriteStatement::PlayerAssociation {
            player_uid,
            key: record.key.clone(),
            created_at: record.created_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn record(key: &str, game_json: &str) -> RawRecord {
        RawRecord {
            key: key.to_string(),
            game_json: game_json.to_string(),
            created_at: DateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn two_players_yield_one_raw_and_two_associations() {
        let rec = record("K1", r#"{"players":[{"uid":"A"},{"uid":"B"}]}"#);
        let stmts = transform(&rec).unwrap();
        assert_eq!(stmts.len(), 3);
        assert!(matches!(&stmts[0], WriteStatement::RawGame { key, .. } if key == "K1"));
        let uids: Vec<&str> = stmts[1..]
            .iter()
            .map(|s| match s {
                WriteStatement::PlayerAssociation { player_uid, .. } => player_uid.as_str(),
                other => panic!("unexpected statement {other:?}"),
            })
            .collect();
        assert_eq!(uids, ["A", "B"]);
    }

    #[test]
    fn missing_players_field_yields_no_associations() {
        let stmts = transform(&record("K1", r#"{"winner":"spies"}"#)).unwrap();
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn non_array_players_field_yields_no_associations() {
        let stmts = transform(&record("K1", r#"{"players":"corrupt"}"#)).unwrap();
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn non_string_uids_are_skipped() {
        let payload = validate_payload(r#"{"players":[{"uid":7},{"uid":"B"},{"name":"noUid"}]}"#)
            .unwrap();
        assert_eq!(payload.player_uids, ["B"]);
    }

    #[test]
    fn duplicate_uids_collapse_in_first_seen_order() {
        let payload =
            validate_payload(r#"{"players":[{"uid":"B"},{"uid":"A"},{"uid":"B"}]}"#).unwrap();
        assert_eq!(payload.player_uids, ["B", "A"]);
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        assert!(validate_payload("{not json").is_err());
        assert!(transform(&record("K1", "{not json")).is_err());
    }

    #[test]
    fn backfill_variant_emits_associations_only() {
        let rec = record("K9", r#"{"players":[{"uid":"A"},{"uid":"B"}]}"#);
        let stmts = associations(&rec).unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(stmts
            .iter()
            .all(|s| matches!(s, WriteStatement::PlayerAssociation { .. })));
    }
}
