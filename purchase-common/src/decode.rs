//! # Decode
//!
//! Turn one NDJSON line into a validated `PurchaseInput`. No I/O happens here.
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::purchase::{ItemType, Platform, PurchaseInput, PurchaseRecord};

pub const MIN_PLAYER_LEVEL: i64 = 1;
pub const MAX_PLAYER_LEVEL: i64 = 100;

/// The first constraint a well-formed record violated.
/// Variants are listed in the order fields are checked.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("transaction_id must not be empty")]
    EmptyTransactionId,
    #[error("player_id must not be empty")]
    EmptyPlayerId,
    #[error("player_username must not be empty")]
    EmptyPlayerUsername,
    #[error("game_title must not be empty")]
    EmptyGameTitle,
    #[error("{0:?} is not a valid item_type")]
    InvalidItemType(String),
    #[error("{0:?} is not a valid platform")]
    InvalidPlatform(String),
    #[error("amount_cents must not be negative, got {0}")]
    NegativeAmount(i64),
    #[error("player_level must be between 1 and 100, got {0}")]
    PlayerLevelOutOfRange(i64),
    #[error("created_at {value:?} is not an RFC 3339 timestamp: {error}")]
    InvalidTimestamp {
        value: String,
        error: chrono::ParseError,
    },
}

/// Enumeration of errors decoding a single line.
/// Both variants carry the 1-based line number of the offending record.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("line {line}: malformed record: {error}")]
    Malformed {
        line: u64,
        error: serde_json::Error,
    },
    #[error("line {line}: invalid record: {error}")]
    Validation { line: u64, error: ValidationError },
}

impl DecodeError {
    pub fn line(&self) -> u64 {
        match self {
            DecodeError::Malformed { line, .. } | DecodeError::Validation { line, .. } => *line,
        }
    }
}

/// Decode one raw line into a validated `PurchaseInput`.
///
/// Callers are expected to skip blank lines before calling this; a blank line here is
/// reported as malformed.
pub fn decode(line: u64, raw: &[u8]) -> Result<PurchaseInput, DecodeError> {
    let record: PurchaseRecord =
        serde_json::from_slice(raw).map_err(|error| DecodeError::Malformed { line, error })?;

    validate(record).map_err(|error| DecodeError::Validation { line, error })
}

/// Validate a deserialized record field by field, in declaration order, stopping at the
/// first violation.
pub fn validate(record: PurchaseRecord) -> Result<PurchaseInput, ValidationError> {
    if record.transaction_id.is_empty() {
        return Err(ValidationError::EmptyTransactionId);
    }
    if record.player_id.is_empty() {
        return Err(ValidationError::EmptyPlayerId);
    }
    if record.player_username.is_empty() {
        return Err(ValidationError::EmptyPlayerUsername);
    }
    if record.game_title.is_empty() {
        return Err(ValidationError::EmptyGameTitle);
    }

    let item_type = ItemType::from_str(&record.item_type)
        .map_err(|e| ValidationError::InvalidItemType(e.value))?;
    let platform = Platform::from_str(&record.platform)
        .map_err(|e| ValidationError::InvalidPlatform(e.value))?;

    if record.amount_cents < 0 {
        return Err(ValidationError::NegativeAmount(record.amount_cents));
    }
    if !(MIN_PLAYER_LEVEL..=MAX_PLAYER_LEVEL).contains(&record.player_level) {
        return Err(ValidationError::PlayerLevelOutOfRange(record.player_level));
    }

    let created_at = parse_timestamp(&record.created_at).map_err(|error| {
        ValidationError::InvalidTimestamp {
            value: record.created_at.clone(),
            error,
        }
    })?;

    Ok(PurchaseInput {
        transaction_id: record.transaction_id,
        player_id: record.player_id,
        player_username: record.player_username,
        game_title: record.game_title,
        item_type,
        genre: record.genre,
        platform,
        amount_cents: record.amount_cents,
        currency: record.currency,
        // Range checked above.
        player_level: record.player_level as i32,
        created_at,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn valid_record() -> PurchaseRecord {
        PurchaseRecord {
            transaction_id: "TXN-001".to_owned(),
            player_id: "player_001".to_owned(),
            player_username: "GamerAlice".to_owned(),
            game_title: "Cyberpunk 2077".to_owned(),
            item_type: "game".to_owned(),
            genre: "RPG".to_owned(),
            platform: "steam".to_owned(),
            amount_cents: 5999,
            currency: "USD".to_owned(),
            player_level: 15,
            created_at: "2025-08-15T10:00:00Z".to_owned(),
        }
    }

    #[test]
    fn test_decode_valid_line() {
        let line = br#"{"transaction_id":"TXN-001","player_id":"player_001","player_username":"GamerAlice","game_title":"Cyberpunk 2077","item_type":"season_pass","genre":"RPG","platform":"playstation","amount_cents":5999,"currency":"USD","player_level":15,"created_at":"2025-08-15T10:00:00+02:00"}"#;

        let input = decode(1, line).expect("failed to decode valid line");

        assert_eq!(input.transaction_id, "TXN-001");
        assert_eq!(input.item_type, ItemType::SeasonPass);
        assert_eq!(input.platform, Platform::Playstation);
        assert_eq!(input.amount_cents, 5999);
        assert_eq!(input.player_level, 15);
        assert_eq!(
            input.created_at,
            Utc.with_ymd_and_hms(2025, 8, 15, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_decode_malformed_line_reports_line_number() {
        let error = decode(7, b"{not json").unwrap_err();

        assert!(matches!(error, DecodeError::Malformed { line: 7, .. }));
        assert_eq!(error.line(), 7);
    }

    #[test]
    fn test_decode_wrong_field_type_is_malformed() {
        let error = decode(3, br#"{"transaction_id":"TXN-1","amount_cents":"lots"}"#).unwrap_err();

        assert!(matches!(error, DecodeError::Malformed { line: 3, .. }));
    }

    #[test]
    fn test_decode_missing_fields_fail_validation_in_order() {
        let error = decode(2, br#"{"transaction_id":"TXN-1"}"#).unwrap_err();

        assert!(matches!(
            error,
            DecodeError::Validation {
                line: 2,
                error: ValidationError::EmptyPlayerId
            }
        ));
    }

    #[test]
    fn test_validate_accepts_valid_record() {
        let input = validate(valid_record()).expect("valid record was rejected");
        assert_eq!(input.item_type, ItemType::Game);
        assert_eq!(input.platform, Platform::Steam);
    }

    #[test]
    fn test_validate_reports_first_violation_in_declaration_order() {
        let record = PurchaseRecord {
            transaction_id: "".to_owned(),
            amount_cents: -100,
            ..valid_record()
        };

        assert!(matches!(
            validate(record),
            Err(ValidationError::EmptyTransactionId)
        ));

        let record = PurchaseRecord {
            item_type: "invalid".to_owned(),
            platform: "invalid".to_owned(),
            player_level: 0,
            ..valid_record()
        };

        assert!(matches!(
            validate(record),
            Err(ValidationError::InvalidItemType(value)) if value == "invalid"
        ));
    }

    #[test]
    fn test_validate_rejects_each_constraint() {
        let cases: Vec<(PurchaseRecord, fn(&ValidationError) -> bool)> = vec![
            (
                PurchaseRecord {
                    player_id: "".to_owned(),
                    ..valid_record()
                },
                |e| matches!(e, ValidationError::EmptyPlayerId),
            ),
            (
                PurchaseRecord {
                    player_username: "".to_owned(),
                    ..valid_record()
                },
                |e| matches!(e, ValidationError::EmptyPlayerUsername),
            ),
            (
                PurchaseRecord {
                    game_title: "".to_owned(),
                    ..valid_record()
                },
                |e| matches!(e, ValidationError::EmptyGameTitle),
            ),
            (
                PurchaseRecord {
                    platform: "invalid".to_owned(),
                    ..valid_record()
                },
                |e| matches!(e, ValidationError::InvalidPlatform(_)),
            ),
            (
                PurchaseRecord {
                    amount_cents: -1,
                    ..valid_record()
                },
                |e| matches!(e, ValidationError::NegativeAmount(-1)),
            ),
            (
                PurchaseRecord {
                    player_level: 0,
                    ..valid_record()
                },
                |e| matches!(e, ValidationError::PlayerLevelOutOfRange(0)),
            ),
            (
                PurchaseRecord {
                    player_level: 101,
                    ..valid_record()
                },
                |e| matches!(e, ValidationError::PlayerLevelOutOfRange(101)),
            ),
            (
                PurchaseRecord {
                    created_at: "2025-08-15 10:00".to_owned(),
                    ..valid_record()
                },
                |e| matches!(e, ValidationError::InvalidTimestamp { .. }),
            ),
        ];

        for (record, expected) in cases {
            let error = validate(record).expect_err("invalid record was accepted");
            assert!(expected(&error), "unexpected error: {}", error);
        }
    }

    #[test]
    fn test_validate_accepts_boundaries() {
        for level in [MIN_PLAYER_LEVEL, MAX_PLAYER_LEVEL] {
            let record = PurchaseRecord {
                player_level: level,
                amount_cents: 0,
                ..valid_record()
            };
            assert!(validate(record).is_ok());
        }
    }
}
