// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

pub mod codec;
pub mod geometry;

use std::sync::LazyLock;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use codec::{CodecError, WireCodec};
pub use geometry::{AllowedArea, ZoneId, ZoneTable};

pub const DEFAULT_API_BASE_URL: &str = "https://api-lok-live.leagueofkingdoms.com/api/";
pub const DEFAULT_AUTH_BASE_URL: &str = "https://lok-api-live.leagueofkingdoms.com/api/";

pub const CRYSTAL_MINE_CODE: u32 = 20100105;
pub const DRAGON_SOUL_CAVERN_CODE: u32 = 20100106;
pub const CRYSTAL_MINE_MIN_KINGDOM_LEVEL: u32 = 11;

pub const MINE_CODES: [u32; 6] = [20100101, 20100102, 20100103, 20100104, 20100105, 20100106];
pub const MONSTER_CODES: [u32; 12] = [
    20200101, 20200102, 20200103, 20200104, 20700405, 20700406, 20700407, 20200301, 20800401,
    20800402, 20800403, 20800404,
];
pub const BOSS_MONSTER_CODE: u32 = 20700501;

/// Action-point items in preference order with the amount used per refill.
pub const ACTION_POINT_ITEMS: [(u32, u32); 4] = [
    (10101052, 2),
    (10101051, 4),
    (10101050, 10),
    (10101049, 20),
];

pub const TASK_CODE_GATHER: i64 = 4;
pub const TASK_CODE_MONSTER: i64 = 5;
pub const TASK_CODE_RALLY: i64 = 7;
pub const TASK_STATUS_ACTIVE: i64 = 1;

pub const FIELD_OBJECT_STATE_AVAILABLE: i64 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Mine,
    Monster,
    Other,
}

pub fn classify_object(code: u32) -> ObjectClass {
    if MINE_CODES.contains(&code) {
        ObjectClass::Mine
    } else if MONSTER_CODES.contains(&code) || code == BOSS_MONSTER_CODE {
        ObjectClass::Monster
    } else {
        ObjectClass::Other
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarchKind {
    Gather,
    Attack,
    Rally,
}

impl MarchKind {
    /// `marchType` value the backend expects on `field/march/start`.
    pub fn wire_type(self) -> i64 {
        match self {
            MarchKind::Gather => 1,
            MarchKind::Attack => 5,
            MarchKind::Rally => 8,
        }
    }

    pub fn from_task_code(code: i64) -> Option<Self> {
        match code {
            TASK_CODE_GATHER => Some(MarchKind::Gather),
            TASK_CODE_MONSTER => Some(MarchKind::Attack),
            TASK_CODE_RALLY => Some(MarchKind::Rally),
            _ => None,
        }
    }
}

/// A map location as the backend sends it: `[world, x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i64; 3]", into = "[i64; 3]")]
pub struct Location {
    pub world: i64,
    pub x: i64,
    pub y: i64,
}

impl Location {
    pub fn new(world: i64, x: i64, y: i64) -> Self {
        Self { world, x, y }
    }

    /// Parses an array value, or a `"w,x,y"` string as used in battle lists.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) if items.len() >= 3 => {
                let mut coords = items.iter().take(3).map(value_as_i64);
                Some(Self::new(coords.next()??, coords.next()??, coords.next()??))
            }
            Value::String(text) => {
                let parts: Vec<i64> = text
                    .split(',')
                    .map(|part| part.trim().parse::<i64>())
                    .collect::<Result<_, _>>()
                    .ok()?;
                (parts.len() >= 3).then(|| Self::new(parts[0], parts[1], parts[2]))
            }
            _ => None,
        }
    }

    pub fn tile_distance(&self, x: i64, y: i64) -> f64 {
        (((self.x - x).pow(2) + (self.y - y).pow(2)) as f64).sqrt()
    }

    pub fn zone_id(&self) -> Option<ZoneId> {
        geometry::zone_id_for(self.x, self.y)
    }
}

impl From<[i64; 3]> for Location {
    fn from(value: [i64; 3]) -> Self {
        Self::new(value[0], value[1], value[2])
    }
}

impl From<Location> for [i64; 3] {
    fn from(value: Location) -> Self {
        [value.world, value.x, value.y]
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.world, self.x, self.y)
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|number| number as i64))
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

/// An interactive map entity reported on the field channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldObject {
    #[serde(rename = "_id")]
    pub id: String,
    pub code: u32,
    #[serde(default)]
    pub level: u32,
    pub loc: Location,
    #[serde(default)]
    pub state: i64,
    #[serde(default)]
    pub occupied: Option<Value>,
}

impl FieldObject {
    pub fn is_available(&self) -> bool {
        self.state == FIELD_OBJECT_STATE_AVAILABLE
    }

    pub fn class(&self) -> ObjectClass {
        classify_object(self.code)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TroopAmount {
    pub code: u32,
    pub amount: u64,
}

/// Expands troop amounts into the full entry shape `marchTroops` requires.
pub fn march_troops_payload(troops: &[TroopAmount]) -> Value {
    Value::Array(
        troops
            .iter()
            .filter(|troop| troop.amount > 0)
            .map(|troop| {
                serde_json::json!({
                    "code": troop.code,
                    "level": 0,
                    "select": 0,
                    "amount": troop.amount,
                    "dead": 0,
                    "wounded": 0,
                    "hp": 0,
                    "attack": 0,
                    "defense": 0,
                    "seq": 0
                })
            })
            .collect(),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarchTask {
    pub id: String,
    pub kind: MarchKind,
    pub destination: Option<Location>,
    /// Field object the march is headed for, when the backend names one.
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub troops: Vec<TroopAmount>,
    pub started_at: Option<DateTime<Utc>>,
    pub expected_end_at: Option<DateTime<Utc>>,
}

impl MarchTask {
    /// Builds a task from a `troops.field` entry or a `newTask` response.
    pub fn from_value(value: &Value, fallback_kind: MarchKind) -> Option<Self> {
        let id = value
            .get("_id")
            .or_else(|| value.get("moId"))
            .and_then(Value::as_str)?
            .to_string();
        let kind = value
            .get("code")
            .and_then(value_as_i64)
            .and_then(MarchKind::from_task_code)
            .unwrap_or(fallback_kind);
        let destination = ["toLoc", "loc"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Location::from_value))
            .or_else(|| {
                value
                    .get("param")
                    .and_then(|param| param.get("toLoc"))
                    .and_then(Location::from_value)
            });
        let target_id = ["toId", "targetId", "foId"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .map(str::to_string);
        let troops = value
            .get("troops")
            .or_else(|| value.get("marchTroops"))
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        Some(TroopAmount {
                            code: u32::try_from(entry.get("code").and_then(value_as_i64)?).ok()?,
                            amount: u64::try_from(entry.get("amount").and_then(value_as_i64)?)
                                .ok()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            id,
            kind,
            destination,
            target_id,
            troops,
            started_at: value.get("started").and_then(parse_timestamp),
            expected_end_at: value.get("expectedEnded").and_then(parse_timestamp),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Building {
    pub code: i64,
    pub position: i64,
    #[serde(default)]
    pub level: i64,
    #[serde(default)]
    pub state: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KingdomTask {
    pub code: i64,
    pub status: i64,
}

impl KingdomTask {
    pub fn is_active_march(&self) -> bool {
        self.status == TASK_STATUS_ACTIVE
            && matches!(
                self.code,
                TASK_CODE_GATHER | TASK_CODE_MONSTER | TASK_CODE_RALLY
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveBuff {
    pub item_code: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ActiveBuff {
    /// Reads one `/buff/list` entry; the item code may sit under `param`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let code = value
            .get("param")
            .and_then(|param| param.get("itemCode"))
            .or_else(|| value.get("itemCode"))
            .or_else(|| value.get("code"))
            .and_then(value_as_i64)?;
        Some(Self {
            item_code: u32::try_from(code).ok()?,
            expires_at: value.get("expiredDate").and_then(parse_timestamp),
        })
    }

    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at
            .map(|expires| (expires - now).num_minutes().max(0))
    }
}

/// Accepts RFC 3339 strings and epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

/// Extracts `_id` from the payload segment of a session token.
pub fn account_id_from_token(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("_id")?.as_str().map(str::to_string)
}

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
});

pub fn expand_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn location_round_trips_through_array_form() {
        let loc: Location = serde_json::from_value(json!([20, 1024, 768])).unwrap();
        assert_eq!(loc, Location::new(20, 1024, 768));
        assert_eq!(serde_json::to_value(loc).unwrap(), json!([20, 1024, 768]));
        assert_eq!(loc.zone_id(), Some(32 + 64 * 24));
    }

    #[test]
    fn location_parses_battle_list_strings_and_rejects_short_arrays() {
        assert_eq!(
            Location::from_value(&json!("20,100,200")),
            Some(Location::new(20, 100, 200))
        );
        assert_eq!(Location::from_value(&json!([20, 100])), None);
        assert_eq!(Location::from_value(&json!("20,abc,1")), None);
    }

    #[test]
    fn classify_object_splits_mines_and_monsters() {
        assert_eq!(classify_object(20100101), ObjectClass::Mine);
        assert_eq!(classify_object(CRYSTAL_MINE_CODE), ObjectClass::Mine);
        assert_eq!(classify_object(20700406), ObjectClass::Monster);
        assert_eq!(classify_object(BOSS_MONSTER_CODE), ObjectClass::Monster);
        assert_eq!(classify_object(12345), ObjectClass::Other);
    }

    #[test]
    fn march_task_reads_troop_queue_entry() {
        let entry = json!({
            "_id": "task-1",
            "code": 4,
            "status": 1,
            "param": {"toLoc": [20, 10, 11]},
            "started": "2026-01-01T00:00:00Z",
            "expectedEnded": 1767229200000i64
        });
        let task = MarchTask::from_value(&entry, MarchKind::Attack).unwrap();
        assert_eq!(task.id, "task-1");
        assert_eq!(task.kind, MarchKind::Gather);
        assert_eq!(task.destination, Some(Location::new(20, 10, 11)));
        assert!(task.started_at.is_some());
        assert!(task.expected_end_at.is_some());
    }

    #[test]
    fn march_troops_payload_skips_empty_entries() {
        let payload = march_troops_payload(&[
            TroopAmount {
                code: 50100305,
                amount: 1200,
            },
            TroopAmount {
                code: 50100306,
                amount: 0,
            },
        ]);
        let entries = payload.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["code"], 50100305);
        assert_eq!(entries[0]["amount"], 1200);
    }

    #[test]
    fn active_buff_prefers_param_item_code() {
        let buff = ActiveBuff::from_value(&json!({
            "code": 1,
            "param": {"itemCode": 10102001},
            "expiredDate": "2026-01-01T02:00:00Z"
        }))
        .unwrap();
        assert_eq!(buff.item_code, 10102001);
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(buff.remaining_minutes(now), Some(90));
    }

    #[test]
    fn kingdom_task_counts_only_active_march_codes() {
        assert!(KingdomTask { code: 4, status: 1 }.is_active_march());
        assert!(!KingdomTask { code: 4, status: 3 }.is_active_march());
        assert!(!KingdomTask { code: 1, status: 1 }.is_active_march());
    }

    #[test]
    fn account_id_is_read_from_token_payload() {
        let claims = URL_SAFE_NO_PAD.encode(br#"{"_id":"5f0c0ffee","exp":1}"#);
        let token = format!("header.{claims}.signature");
        assert_eq!(account_id_from_token(&token).as_deref(), Some("5f0c0ffee"));
        assert_eq!(account_id_from_token("garbage"), None);
    }

    #[test]
    fn expand_env_vars_substitutes_and_blanks_missing() {
        // SAFETY: test-local variable name, not read concurrently elsewhere.
        unsafe { std::env::set_var("LOK_COMMON_TEST_VAR", "value") };
        assert_eq!(
            expand_env_vars("a=${LOK_COMMON_TEST_VAR} b=${LOK_COMMON_MISSING_VAR}"),
            "a=value b="
        );
    }
}
