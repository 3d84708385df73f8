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

use async_trait::async_trait;
use lok_common::{KingdomTask, Location, TroopAmount, WireCodec, march_troops_payload};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Backend view of the destination returned by `field/march/info`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarchInfo {
    pub num_march: usize,
    pub fo: Option<Value>,
}

impl MarchInfo {
    pub fn from_value(value: &Value) -> Self {
        Self {
            num_march: value
                .get("numMarch")
                .and_then(Value::as_u64)
                .unwrap_or_default() as usize,
            fo: value.get("fo").cloned(),
        }
    }

    /// True when the destination already carries an occupant or a rally.
    pub fn destination_taken(&self) -> bool {
        self.fo.as_ref().is_some_and(|fo| {
            ["occupied", "rally"]
                .iter()
                .any(|key| fo.get(*key).is_some_and(is_truthy))
        })
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// The backend surface the engine drives. Only `call`, `login` and `connect`
/// touch the wire; everything else is a typed wrapper over `call`.
#[async_trait]
pub trait GameApi: Send + Sync {
    async fn call(&self, endpoint: &str, body: Value) -> Result<Value, ApiError>;

    /// Logs in and installs the returned token.
    async fn login(&self, credentials: &Credentials) -> Result<String, ApiError>;

    /// Runs the handshake that negotiates the XOR key and protected endpoints.
    async fn connect(&self) -> Result<(), ApiError>;

    async fn current_token(&self) -> Option<String>;

    async fn install_token(&self, token: String);

    /// Codec for the current session's socket payloads.
    async fn codec(&self) -> WireCodec;

    async fn kingdom_enter(&self) -> Result<Value, ApiError> {
        self.call("kingdom/enter", json!({})).await
    }

    async fn set_device_info(&self) -> Result<Value, ApiError> {
        self.call(
            "auth/setDeviceInfo",
            json!({"deviceInfo": device_info()}),
        )
        .await
    }

    async fn chat_logs(&self, channel: &str) -> Result<Value, ApiError> {
        self.call("chat/logs", json!({"chatChannel": channel})).await
    }

    async fn chat_new(&self, channel: &str, text: &str) -> Result<Value, ApiError> {
        self.call(
            "chat/new",
            json!({"chatChannel": channel, "chatType": 1, "text": text}),
        )
        .await
    }

    async fn profile_troops(&self) -> Result<Value, ApiError> {
        self.call("kingdom/profile/troops", json!({})).await
    }

    async fn task_all(&self) -> Result<Vec<KingdomTask>, ApiError> {
        let response = self.call("kingdom/task/all", json!({})).await?;
        Ok(response
            .get("kingdomTasks")
            .and_then(Value::as_array)
            .map(|tasks| {
                tasks
                    .iter()
                    .filter_map(|task| serde_json::from_value::<KingdomTask>(task.clone()).ok())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn march_info(&self, from_id: &str, to: Location) -> Result<MarchInfo, ApiError> {
        let response = self
            .call("field/march/info", json!({"fromId": from_id, "toLoc": to}))
            .await?;
        Ok(MarchInfo::from_value(&response))
    }

    async fn march_start(&self, body: Value) -> Result<Value, ApiError> {
        self.call("field/march/start", body).await
    }

    async fn rally_start(&self, body: Value) -> Result<Value, ApiError> {
        self.call("field/rally/start", body).await
    }

    async fn rally_join(&self, rally_id: &str, troops: &[TroopAmount]) -> Result<Value, ApiError> {
        self.call(
            "field/rally/join",
            json!({"rallyId": rally_id, "marchTroops": march_troops_payload(troops)}),
        )
        .await
    }

    async fn battle_list(&self) -> Result<Vec<Value>, ApiError> {
        let response = self.call("alliance/battle/list/v2", json!({})).await?;
        Ok(response
            .get("battles")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn item_list(&self) -> Result<Vec<Value>, ApiError> {
        let response = self.call("item/list", json!({})).await?;
        Ok(response
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn item_use(&self, code: u32, amount: u32) -> Result<Value, ApiError> {
        self.call("item/use", json!({"code": code, "amount": amount}))
            .await
    }

    async fn skill_list(&self) -> Result<Vec<Value>, ApiError> {
        let response = self.call("skill/list", json!({})).await?;
        Ok(response
            .get("skills")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn skill_use(&self, code: u32) -> Result<Value, ApiError> {
        self.call("skill/use", json!({"code": code})).await
    }
}

pub fn device_info() -> Value {
    json!({
        "build": "global",
        "OS": "Windows 10",
        "country": "USA",
        "language": "English",
        "bundle": "",
        "version": "1.1694.152.229",
        "platform": "web",
        "pushId": ""
    })
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::sync::RwLock;

    /// Scripted backend: per-endpoint queues of responses, every call recorded.
    #[derive(Default)]
    pub struct ScriptedApi {
        pub calls: Mutex<Vec<(String, Value)>>,
        responses: Mutex<HashMap<String, VecDeque<Result<Value, ApiError>>>>,
        defaults: Mutex<HashMap<String, Value>>,
        pub logins: Mutex<u32>,
        pub connects: Mutex<u32>,
        token: RwLock<Option<String>>,
        codec: WireCodec,
    }

    impl ScriptedApi {
        pub fn new() -> Self {
            let api = Self {
                codec: WireCodec::new("fieldkey"),
                ..Self::default()
            };
            api.set_default("kingdom/enter", sample_kingdom_enter());
            api.set_default(
                "kingdom/profile/troops",
                json!({"troops": {"field": []}, "info": {"marchLimit": 5, "marchSize": 10000}}),
            );
            api.set_default("kingdom/task/all", json!({"kingdomTasks": []}));
            api.set_default("field/march/info", json!({"numMarch": 0}));
            api
        }

        pub fn push(&self, endpoint: &str, response: Result<Value, ApiError>) {
            self.responses
                .lock()
                .unwrap()
                .entry(endpoint.to_string())
                .or_default()
                .push_back(response);
        }

        pub fn set_default(&self, endpoint: &str, response: Value) {
            self.defaults
                .lock()
                .unwrap()
                .insert(endpoint.to_string(), response);
        }

        pub fn count(&self, endpoint: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == endpoint)
                .count()
        }

        pub fn bodies(&self, endpoint: &str) -> Vec<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == endpoint)
                .map(|(_, body)| body.clone())
                .collect()
        }

        pub fn connect_count(&self) -> u32 {
            *self.connects.lock().unwrap()
        }
    }

    #[async_trait]
    impl GameApi for ScriptedApi {
        async fn call(&self, endpoint: &str, body: Value) -> Result<Value, ApiError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.to_string(), body));
            if let Some(next) = self
                .responses
                .lock()
                .unwrap()
                .get_mut(endpoint)
                .and_then(VecDeque::pop_front)
            {
                return next;
            }
            Ok(self
                .defaults
                .lock()
                .unwrap()
                .get(endpoint)
                .cloned()
                .unwrap_or_else(|| json!({"result": true})))
        }

        async fn login(&self, _credentials: &Credentials) -> Result<String, ApiError> {
            *self.logins.lock().unwrap() += 1;
            let token = "fresh.token.value".to_string();
            *self.token.write().await = Some(token.clone());
            Ok(token)
        }

        async fn connect(&self) -> Result<(), ApiError> {
            *self.connects.lock().unwrap() += 1;
            Ok(())
        }

        async fn current_token(&self) -> Option<String> {
            self.token.read().await.clone()
        }

        async fn install_token(&self, token: String) {
            *self.token.write().await = Some(token);
        }

        async fn codec(&self) -> WireCodec {
            self.codec.clone()
        }
    }

    pub fn sample_kingdom_enter() -> Value {
        json!({
            "kingdom": {
                "_id": "kingdom-1",
                "fieldObjectId": "fo-home",
                "level": 20,
                "worldId": 20,
                "allianceId": "alliance-1",
                "loc": [20, 1000, 1000],
                "resources": [100, 200, 300, 400],
                "vip": {"level": 5},
                "buildings": [
                    {"code": 40100101, "position": 1, "level": 20, "state": 1},
                    {"code": 40100201, "position": 2, "level": 18, "state": 1}
                ],
                "buffs": []
            },
            "networks": {
                "kingdoms": ["https://sock-lok-live.leagueofkingdoms.com/socket.io/"],
                "chats": ["https://socc-lok-live.leagueofkingdoms.com/socket.io/"],
                "fields": ["https://socf-lok-live.leagueofkingdoms.com/socket.io/"]
            },
            "dragos": [{"_id": "drago-1"}]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedApi;
    use super::*;

    #[test]
    fn march_info_detects_occupied_or_rallied_destination() {
        let free = MarchInfo::from_value(&json!({"numMarch": 2, "fo": {"occupied": null}}));
        assert_eq!(free.num_march, 2);
        assert!(!free.destination_taken());

        let occupied = MarchInfo::from_value(&json!({"fo": {"occupied": {"id": "x"}}}));
        assert!(occupied.destination_taken());

        let rallied = MarchInfo::from_value(&json!({"fo": {"rally": true}}));
        assert!(rallied.destination_taken());
    }

    #[tokio::test]
    async fn typed_wrappers_hit_expected_endpoints() {
        let api = ScriptedApi::new();
        api.push(
            "kingdom/task/all",
            Ok(json!({"kingdomTasks": [
                {"code": 4, "status": 1},
                {"code": 1, "status": 1},
                {"bogus": true}
            ]})),
        );
        let tasks = api.task_all().await.unwrap();
        assert_eq!(tasks.len(), 2);

        api.rally_join(
            "rally-9",
            &[TroopAmount {
                code: 50100305,
                amount: 10,
            }],
        )
        .await
        .unwrap();
        let body = &api.bodies("field/rally/join")[0];
        assert_eq!(body["rallyId"], "rally-9");
        assert_eq!(body["marchTroops"][0]["amount"], 10);

        let info = api
            .march_info("fo-home", Location::new(20, 5, 6))
            .await
            .unwrap();
        assert_eq!(info.num_march, 0);
        assert_eq!(api.bodies("field/march/info")[0]["toLoc"], json!([20, 5, 6]));
    }
}
