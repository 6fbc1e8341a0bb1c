use crate::domain::timestamp::json_type_name;
use crate::domain::{
    coerce_timestamp, source_id_from_topic, NormalizeError, NormalizeResult, NormalizerConfig,
};
use common::domain::{
    Measurements, SensorReading, MAX_SOURCE_ID_LEN, MEASUREMENT_KEYS, WIND_TEXT_KEY,
};
use serde_json::{Map, Value};
use tracing::warn;

/// One object from a batch that could not be normalized
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedObject {
    /// Position of the object in the inbound message (0 for single objects)
    pub index: usize,
    pub error: NormalizeError,
}

/// Readings decoded from one inbound message, in input order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub readings: Vec<SensorReading>,
    pub rejected: Vec<RejectedObject>,
}

/// Turns raw MQTT payloads into canonical sensor readings
///
/// Flow:
/// 1. Decode UTF-8; blank payloads are heartbeats and produce nothing
/// 2. Parse JSON; a single object or an array of objects is accepted
/// 3. Per object: resolve the source ID (payload or topic), resolve and coerce
///    the timestamp, copy recognized measurements
/// 4. Objects that fail step 3 are dropped individually; siblings continue
pub struct PayloadNormalizer {
    config: NormalizerConfig,
}

impl PayloadNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalize one inbound message
    ///
    /// # Returns
    /// * `Ok(None)` - Empty or whitespace-only payload
    /// * `Ok(Some(batch))` - Accepted readings plus any per-object rejections
    /// * `Err(NormalizeError)` - Malformed JSON or an unsupported shape; the
    ///   whole message is dropped
    pub fn normalize(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> NormalizeResult<Option<NormalizedBatch>> {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let body: Value = serde_json::from_str(text)
            .map_err(|e| NormalizeError::MalformedPayload(e.to_string()))?;

        let objects = match body {
            Value::Object(object) => vec![object],
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| match item {
                    Value::Object(object) => Ok(object),
                    other => Err(NormalizeError::UnsupportedShape(format!(
                        "array element {} is {}, expected an object",
                        index,
                        json_type_name(&other)
                    ))),
                })
                .collect::<NormalizeResult<Vec<_>>>()?,
            other => {
                return Err(NormalizeError::UnsupportedShape(format!(
                    "top-level {} is neither an object nor an array",
                    json_type_name(&other)
                )))
            }
        };

        let topic_source_id = source_id_from_topic(topic, self.config.topic_source_segment);
        let mut batch = NormalizedBatch::default();

        for (index, mut object) in objects.into_iter().enumerate() {
            match self.normalize_object(&mut object, topic, topic_source_id) {
                Ok(reading) => batch.readings.push(reading),
                Err(error) => {
                    warn!(
                        topic = %topic,
                        index,
                        error = %error,
                        payload = %self.preview_object(&object),
                        "dropping invalid sensor object"
                    );
                    batch.rejected.push(RejectedObject { index, error });
                }
            }
        }

        Ok(Some(batch))
    }

    /// Truncated payload text for log lines
    pub fn preview(&self, payload: &[u8]) -> String {
        truncate_chars(&String::from_utf8_lossy(payload), self.config.preview_len)
    }

    fn preview_object(&self, object: &Map<String, Value>) -> String {
        let text = serde_json::to_string(object).unwrap_or_default();
        truncate_chars(&text, self.config.preview_len)
    }

    /// Fill defaults into `object` and build a reading from it.
    ///
    /// On success the object is moved into the reading as its raw payload.
    fn normalize_object(
        &self,
        object: &mut Map<String, Value>,
        topic: &str,
        topic_source_id: Option<&str>,
    ) -> NormalizeResult<SensorReading> {
        let source_id = self.resolve_source_id(object, topic, topic_source_id)?;
        let raw_timestamp = self.resolve_timestamp(object)?;
        let observed_at = coerce_timestamp(&raw_timestamp)?;

        let mut measurements = Measurements::default();
        for key in MEASUREMENT_KEYS {
            if let (Some(value), Some(slot)) = (object.get(key), measurements.slot_mut(key)) {
                *slot = parse_measurement(key, value)?;
            }
        }

        let wind_txt = match object.get(WIND_TEXT_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(NormalizeError::InvalidMeasurement {
                    field: WIND_TEXT_KEY.to_string(),
                    reason: format!("expected a string, got {}", json_type_name(other)),
                })
            }
        };

        SensorReading::new(
            source_id,
            observed_at,
            measurements,
            wind_txt,
            std::mem::take(object),
        )
        .map_err(|e| NormalizeError::InvalidSourceId(e.to_string()))
    }

    fn resolve_source_id(
        &self,
        object: &mut Map<String, Value>,
        topic: &str,
        topic_source_id: Option<&str>,
    ) -> NormalizeResult<String> {
        let key = &self.config.source_id_key;

        let source_id = match object.get(key) {
            None | Some(Value::Null) => {
                let from_topic = topic_source_id.ok_or_else(|| NormalizeError::MissingSourceId {
                    key: key.clone(),
                    topic: topic.to_string(),
                })?;
                object.insert(key.clone(), Value::String(from_topic.to_string()));
                from_topic.to_string()
            }
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) => {
                return Err(NormalizeError::InvalidSourceId(format!(
                    "'{}' is blank",
                    key
                )))
            }
            Some(other) => {
                return Err(NormalizeError::InvalidSourceId(format!(
                    "'{}' must be a string, got {}",
                    key,
                    json_type_name(other)
                )))
            }
        };

        if source_id.chars().count() > MAX_SOURCE_ID_LEN {
            return Err(NormalizeError::InvalidSourceId(format!(
                "'{}' exceeds {} characters",
                source_id, MAX_SOURCE_ID_LEN
            )));
        }

        Ok(source_id)
    }

    /// Find the raw timestamp, copying an alternate key into the canonical one
    fn resolve_timestamp(&self, object: &mut Map<String, Value>) -> NormalizeResult<Value> {
        let key = &self.config.timestamp_key;

        match object.get(key) {
            Some(value) if !value.is_null() => return Ok(value.clone()),
            _ => {}
        }

        let fallback = self
            .config
            .timestamp_fallback_keys
            .iter()
            .find_map(|k| object.get(k).filter(|v| !v.is_null()).cloned());

        match fallback {
            Some(value) => {
                object.insert(key.clone(), value.clone());
                Ok(value)
            }
            None => {
                let mut searched = vec![key.as_str()];
                searched.extend(self.config.timestamp_fallback_keys.iter().map(String::as_str));
                Err(NormalizeError::MissingTimestamp(searched.join(", ")))
            }
        }
    }
}

fn parse_measurement(field: &str, value: &Value) -> NormalizeResult<Option<f64>> {
    let invalid = |reason: String| NormalizeError::InvalidMeasurement {
        field: field.to_string(),
        reason,
    };

    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(format!("unrepresentable number {}", n))),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(invalid(format!("'{}' is not a number", s))),
        },
        other => Err(invalid(format!(
            "expected a number, got {}",
            json_type_name(other)
        ))),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn normalizer() -> PayloadNormalizer {
        PayloadNormalizer::new(NormalizerConfig::default())
    }

    fn normalize(topic: &str, payload: &str) -> NormalizeResult<Option<NormalizedBatch>> {
        normalizer().normalize(topic, payload.as_bytes())
    }

    fn batch(topic: &str, payload: &str) -> NormalizedBatch {
        normalize(topic, payload).unwrap().unwrap()
    }

    #[test]
    fn test_single_object_becomes_one_reading() {
        let input = json!({
            "uid": "station-01",
            "datetime": 1700000000,
            "co": 0.41,
            "pm25": 12,
            "windSpeed": 3.5,
            "wind_txt": "NE",
            "firmware": "1.2.0"
        });

        let result = batch("aqms/ignored/data", &input.to_string());

        assert_eq!(result.readings.len(), 1);
        assert!(result.rejected.is_empty());

        let reading = &result.readings[0];
        assert_eq!(reading.source_id(), "station-01");
        assert_eq!(reading.observed_at(), Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        assert_eq!(reading.measurements().co, Some(0.41));
        assert_eq!(reading.measurements().pm25, Some(12.0));
        assert_eq!(reading.measurements().wind_speed, Some(3.5));
        assert_eq!(reading.measurements().no2, None);
        assert_eq!(reading.wind_txt(), Some("NE"));
        assert_eq!(&Value::Object(reading.raw_payload().clone()), &input);
    }

    #[test]
    fn test_missing_source_id_taken_from_topic() {
        let result = batch("x/SENSOR42/y", r#"{"datetime": 1700000000, "rh": 55}"#);

        let reading = &result.readings[0];
        assert_eq!(reading.source_id(), "SENSOR42");
        assert_eq!(reading.raw_payload()["uid"], json!("SENSOR42"));
        assert_eq!(reading.raw_payload()["rh"], json!(55));
    }

    #[test]
    fn test_missing_source_id_without_topic_segment_rejected() {
        let result = batch("aqms", r#"{"datetime": 1700000000}"#);

        assert!(result.readings.is_empty());
        assert_eq!(result.rejected.len(), 1);
        assert!(matches!(
            result.rejected[0].error,
            NormalizeError::MissingSourceId { .. }
        ));
    }

    #[test]
    fn test_invalid_source_ids_rejected() {
        let numeric = batch("aqms/s1", r#"{"uid": 42, "datetime": 1700000000}"#);
        assert!(matches!(
            numeric.rejected[0].error,
            NormalizeError::InvalidSourceId(_)
        ));

        let blank = batch("aqms/s1", r#"{"uid": "  ", "datetime": 1700000000}"#);
        assert!(matches!(
            blank.rejected[0].error,
            NormalizeError::InvalidSourceId(_)
        ));

        let long = json!({"uid": "x".repeat(65), "datetime": 1700000000});
        let oversized = batch("aqms/s1", &long.to_string());
        assert!(matches!(
            oversized.rejected[0].error,
            NormalizeError::InvalidSourceId(_)
        ));
    }

    #[test]
    fn test_fallback_timestamp_keys_in_priority_order() {
        let result = batch(
            "aqms/s1",
            r#"{"uid": "s1", "time": 1700000100, "ts": 1700000000, "t": 1700000200}"#,
        );

        let reading = &result.readings[0];
        assert_eq!(reading.observed_at().timestamp(), 1_700_000_000);
        assert_eq!(reading.raw_payload()["datetime"], json!(1700000000));
        assert_eq!(reading.raw_payload()["ts"], json!(1700000000));
    }

    #[test]
    fn test_missing_timestamp_rejected() {
        let result = batch("aqms/s1", r#"{"uid": "s1", "co": 1.0}"#);
        assert!(matches!(
            result.rejected[0].error,
            NormalizeError::MissingTimestamp(_)
        ));
    }

    #[test]
    fn test_millis_and_iso_timestamps_accepted() {
        let result = batch(
            "aqms/s1",
            r#"[
                {"uid": "s1", "datetime": 1700000000000},
                {"uid": "s1", "datetime": "2023-11-14T22:13:20Z"},
                {"uid": "s1", "datetime": "1700000000"}
            ]"#,
        );

        assert_eq!(result.readings.len(), 3);
        for reading in &result.readings {
            assert_eq!(reading.observed_at().timestamp(), 1_700_000_000);
        }
    }

    #[test]
    fn test_array_keeps_order_and_drops_invalid_objects() {
        let result = batch(
            "aqms/s1",
            r#"[
                {"uid": "a", "datetime": 1700000000},
                {"uid": "b", "datetime": "not a time"},
                {"uid": "c", "datetime": 1700000060},
                {"uid": "d"},
                {"uid": "e", "datetime": 1700000120}
            ]"#,
        );

        let ids: Vec<&str> = result.readings.iter().map(|r| r.source_id()).collect();
        assert_eq!(ids, vec!["a", "c", "e"]);

        let rejected: Vec<usize> = result.rejected.iter().map(|r| r.index).collect();
        assert_eq!(rejected, vec![1, 3]);
        assert!(matches!(
            result.rejected[0].error,
            NormalizeError::InvalidTimestamp(_)
        ));
    }

    #[test]
    fn test_raw_payload_per_element() {
        let result = batch(
            "aqms/s9",
            r#"[{"ts": 1700000000, "pm10": 20}, {"ts": 1700000060, "pm10": 21}]"#,
        );

        assert_eq!(
            Value::Object(result.readings[0].raw_payload().clone()),
            json!({"ts": 1700000000, "pm10": 20, "uid": "s9", "datetime": 1700000000})
        );
        assert_eq!(
            Value::Object(result.readings[1].raw_payload().clone()),
            json!({"ts": 1700000060, "pm10": 21, "uid": "s9", "datetime": 1700000060})
        );
    }

    #[test]
    fn test_empty_array_yields_no_readings() {
        let result = batch("aqms/s1", "[]");
        assert!(result.readings.is_empty());
        assert!(result.rejected.is_empty());
    }

    #[test]
    fn test_blank_payload_is_heartbeat() {
        assert_eq!(normalize("aqms/s1", "").unwrap(), None);
        assert_eq!(normalize("aqms/s1", "  \n\t ").unwrap(), None);
    }

    #[test]
    fn test_malformed_json_rejects_whole_message() {
        let err = normalize("aqms/s1", "{not json").unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedPayload(_)));
    }

    #[test]
    fn test_invalid_utf8_is_malformed_not_panic() {
        let err = normalizer()
            .normalize("aqms/s1", &[0xff, 0xfe, 0x7b])
            .unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedPayload(_)));
    }

    #[test]
    fn test_unsupported_shapes() {
        for payload in ["42", "\"text\"", "true", "null", "[1, 2]", "[{\"uid\": \"a\"}, [1]]"] {
            let err = normalize("aqms/s1", payload).unwrap_err();
            assert!(
                matches!(err, NormalizeError::UnsupportedShape(_)),
                "expected {} to be unsupported",
                payload
            );
        }
    }

    #[test]
    fn test_absent_and_null_measurements_stay_unset() {
        let result = batch(
            "aqms/s1",
            r#"{"uid": "s1", "datetime": 1700000000, "co": null, "temp": 0}"#,
        );

        let m = result.readings[0].measurements();
        assert_eq!(m.co, None);
        assert_eq!(m.temp, Some(0.0));
        assert_eq!(m.noise, None);
        assert_eq!(m.reported_count(), 1);
    }

    #[test]
    fn test_numeric_string_measurements_coerced() {
        let result = batch(
            "aqms/s1",
            r#"{"uid": "s1", "datetime": 1700000000, "so2": "0.015", "noise": " 61 "}"#,
        );

        let m = result.readings[0].measurements();
        assert_eq!(m.so2, Some(0.015));
        assert_eq!(m.noise, Some(61.0));
    }

    #[test]
    fn test_non_numeric_measurement_rejects_object() {
        let result = batch(
            "aqms/s1",
            r#"[
                {"uid": "s1", "datetime": 1700000000, "o3": "high"},
                {"uid": "s1", "datetime": 1700000000, "wind_txt": 12},
                {"uid": "s1", "datetime": 1700000000, "o3": 0.03}
            ]"#,
        );

        assert_eq!(result.readings.len(), 1);
        assert_eq!(result.readings[0].measurements().o3, Some(0.03));
        assert_eq!(result.rejected.len(), 2);
        assert!(matches!(
            &result.rejected[0].error,
            NormalizeError::InvalidMeasurement { field, .. } if field == "o3"
        ));
        assert!(matches!(
            &result.rejected[1].error,
            NormalizeError::InvalidMeasurement { field, .. } if field == "wind_txt"
        ));
    }

    #[test]
    fn test_custom_keys_from_config() {
        let normalizer = PayloadNormalizer::new(NormalizerConfig {
            source_id_key: "device".to_string(),
            timestamp_key: "observed".to_string(),
            timestamp_fallback_keys: vec!["epoch".to_string()],
            topic_source_segment: 2,
            ..Default::default()
        });

        let result = normalizer
            .normalize("site/a/dev-7", br#"{"epoch": 1700000000}"#)
            .unwrap()
            .unwrap();

        let reading = &result.readings[0];
        assert_eq!(reading.source_id(), "dev-7");
        assert_eq!(reading.raw_payload()["device"], json!("dev-7"));
        assert_eq!(reading.raw_payload()["observed"], json!(1700000000));
    }

    #[test]
    fn test_preview_truncates() {
        let normalizer = PayloadNormalizer::new(NormalizerConfig {
            preview_len: 5,
            ..Default::default()
        });
        assert_eq!(normalizer.preview(b"abcdefgh"), "abcde...");
        assert_eq!(normalizer.preview(b"abc"), "abc");
    }
}
