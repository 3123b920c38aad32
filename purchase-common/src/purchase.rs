//! # Purchase
//!
//! Domain types shared by the ingest api and the enrichment worker.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a string does not name one of our closed enumerations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{value} is not a valid {kind}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Enumeration of the kinds of items a player can buy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "item_type", rename_all = "snake_case")]
pub enum ItemType {
    Game,
    Dlc,
    Cosmetic,
    Currency,
    SeasonPass,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Game => "game",
            ItemType::Dlc => "dlc",
            ItemType::Cosmetic => "cosmetic",
            ItemType::Currency => "currency",
            ItemType::SeasonPass => "season_pass",
        }
    }
}

impl FromStr for ItemType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "game" => Ok(ItemType::Game),
            "dlc" => Ok(ItemType::Dlc),
            "cosmetic" => Ok(ItemType::Cosmetic),
            "currency" => Ok(ItemType::Currency),
            "season_pass" => Ok(ItemType::SeasonPass),
            invalid => Err(ParseEnumError {
                kind: "item_type",
                value: invalid.to_owned(),
            }),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumeration of the storefronts a purchase can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "platform", rename_all = "snake_case")]
pub enum Platform {
    Steam,
    Epic,
    Xbox,
    Playstation,
    Nintendo,
    Mobile,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Steam => "steam",
            Platform::Epic => "epic",
            Platform::Xbox => "xbox",
            Platform::Playstation => "playstation",
            Platform::Nintendo => "nintendo",
            Platform::Mobile => "mobile",
        }
    }
}

impl FromStr for Platform {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "steam" => Ok(Platform::Steam),
            "epic" => Ok(Platform::Epic),
            "xbox" => Ok(Platform::Xbox),
            "playstation" => Ok(Platform::Playstation),
            "nintendo" => Ok(Platform::Nintendo),
            "mobile" => Ok(Platform::Mobile),
            invalid => Err(ParseEnumError {
                kind: "platform",
                value: invalid.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A purchase record exactly as it arrives on the wire, one JSON object per line.
/// Fields missing from the JSON take their zero value and are caught by validation.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PurchaseRecord {
    pub transaction_id: String,
    pub player_id: String,
    pub player_username: String,
    pub game_title: String,
    pub item_type: String,
    pub genre: String,
    pub platform: String,
    pub amount_cents: i64,
    pub currency: String,
    pub player_level: i64,
    pub created_at: String,
}

/// A validated purchase, ready to be upserted.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseInput {
    pub transaction_id: String,
    pub player_id: String,
    pub player_username: String,
    pub game_title: String,
    pub item_type: ItemType,
    pub genre: String,
    pub platform: Platform,
    pub amount_cents: i64,
    pub currency: String,
    pub player_level: i32,
    pub created_at: DateTime<Utc>,
}

/// A purchase as stored.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Purchase {
    /// Storage assigned, monotonically increasing. Used as the keyset pagination key.
    pub id: i64,
    pub transaction_id: String,
    pub player_id: String,
    pub player_username: String,
    pub game_title: String,
    pub item_type: ItemType,
    pub genre: String,
    pub platform: Platform,
    pub amount_cents: i64,
    pub currency: String,
    pub player_level: i32,
    pub created_at: DateTime<Utc>,
    /// Whether the enrichment worker has credited this purchase.
    pub processed: bool,
    /// Loyalty points already credited to the player for this purchase.
    pub loyalty_points: i64,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Accumulated loyalty for a single player.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlayerLoyalty {
    pub player_id: String,
    pub loyalty_points: i64,
    pub updated_at: DateTime<Utc>,
}

/// What an upsert did to the row keyed by the transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

impl UpsertOutcome {
    pub fn from_created(created: bool) -> Self {
        if created {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, UpsertOutcome::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_type_round_trips_through_str() {
        for item_type in [
            ItemType::Game,
            ItemType::Dlc,
            ItemType::Cosmetic,
            ItemType::Currency,
            ItemType::SeasonPass,
        ] {
            assert_eq!(ItemType::from_str(item_type.as_str()), Ok(item_type));
        }
    }

    #[test]
    fn test_enum_parsing_is_case_sensitive() {
        assert!(ItemType::from_str("Game").is_err());
        assert!(Platform::from_str("STEAM").is_err());

        let error = Platform::from_str("dreamcast").unwrap_err();
        assert_eq!(error.to_string(), "dreamcast is not a valid platform");
    }

    #[test]
    fn test_enums_serialize_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&ItemType::SeasonPass).unwrap(),
            "\"season_pass\""
        );
        assert_eq!(
            serde_json::to_string(&Platform::Playstation).unwrap(),
            "\"playstation\""
        );
    }
}
