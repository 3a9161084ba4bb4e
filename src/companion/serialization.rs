//! 序列化辅助函数
//!
//! 远程存储的时间字段是 RFC 3339 字符串（timestamptz），本地统一用毫秒时间戳。

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// 毫秒时间戳序列化为 RFC 3339 字符串
pub fn serialize_millis<S>(millis: &i64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let dt = millis_to_datetime(*millis)
        .ok_or_else(|| serde::ser::Error::custom(format!("无效的时间戳: {}", millis)))?;
    serializer.serialize_str(&dt.to_rfc3339())
}

/// RFC 3339 字符串反序列化为毫秒时间戳（支持 null 值，null 时返回 0）
pub fn deserialize_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let opt_s: Option<String> = Deserialize::deserialize(deserializer)?;
    let s = match opt_s {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(0),
    };
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.timestamp_millis())
        .map_err(serde::de::Error::custom)
}

/// 毫秒时间戳转 `DateTime<Utc>`
pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Stamp {
        #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
        at: i64,
    }

    #[test]
    fn rfc3339_round_trip_keeps_millis() {
        let json = serde_json::to_string(&Stamp { at: 1_700_000_000_123 }).unwrap();
        assert!(json.contains("2023-11-14T22:13:20.123"));
        let back: Stamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back.at, 1_700_000_000_123);
    }

    #[test]
    fn null_and_offset_timestamps() {
        let s: Stamp = serde_json::from_str(r#"{"at": null}"#).unwrap();
        assert_eq!(s.at, 0);
        let s: Stamp = serde_json::from_str(r#"{"at": "2024-01-01T08:00:00+08:00"}"#).unwrap();
        assert_eq!(s.at, 1_704_067_200_000);
    }
}
