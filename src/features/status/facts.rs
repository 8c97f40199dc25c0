use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// 外部采集器产出的状态数据，本模块只透传，不解释其内容。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct StatusFacts(Map<String, Value>);

impl StatusFacts {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 补齐模板依赖但采集器可能不提供的字段；已存在的键保持不变。
    pub fn with_defaults(mut self, bot_nick: &str, adapter: &str) -> Self {
        self.0
            .entry("nonebot_version")
            .or_insert_with(|| Value::from("AstrBot"));
        self.0
            .entry("ps_version")
            .or_insert_with(|| Value::from("v1.0.0"));
        let connected = self
            .0
            .get("nonebot_run_time")
            .cloned()
            .unwrap_or_else(|| Value::from(""));
        self.0.entry("bots").or_insert_with(|| {
            json!([{
                "self_id": "",
                "nick": bot_nick,
                "adapter": adapter,
                "bot_connected": connected,
                "msg_rec": 0,
                "msg_sent": 0,
            }])
        });
        self
    }
}

impl From<Map<String, Value>> for StatusFacts {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_only_missing_keys() {
        let mut map = Map::new();
        map.insert("ps_version".into(), Value::from("v9"));
        let facts = StatusFacts::new(map).with_defaults("bot", "qq");

        assert_eq!(facts.get("ps_version"), Some(&Value::from("v9")));
        assert_eq!(facts.get("nonebot_version"), Some(&Value::from("AstrBot")));
        let bots = facts.get("bots").and_then(Value::as_array).expect("bots");
        assert_eq!(bots[0]["nick"], "bot");
        assert_eq!(bots[0]["adapter"], "qq");
    }
}
