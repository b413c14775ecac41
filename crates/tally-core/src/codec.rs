//! Payload encoding for queued events.
//!
//! New payloads are always written as a versioned envelope. Reads go through
//! an ordered [`DecoderChain`] because older producers wrote other shapes:
//!
//! 1. [`EnvelopeDecoder`]: `{"v": 2, "event": {...}}`, the current encoding.
//! 2. [`LegacyJsonDecoder`]: a flat, loosely typed JSON object with camelCase
//!    keys, numbers that may be strings, and several timestamp formats.
//! 3. [`RawBytesDecoder`]: bytes that are not valid JSON as stored (binary
//!    prefixes, type-tagged arrays); recovers the embedded object and hands it
//!    to the legacy decoder.
//!
//! The first decoder that succeeds wins.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TallyError};
use crate::event::{normalize_action_type, ActivityEvent, Origin};
use crate::types::{EventStatus, Priority};

pub const ENVELOPE_VERSION: u32 = 2;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u32,
    event: &'a ActivityEvent,
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    event: ActivityEvent,
}

/// Encode an event in the current envelope format.
pub fn encode(event: &ActivityEvent) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&EnvelopeRef {
        v: ENVELOPE_VERSION,
        event,
    })?)
}

// ---------------------------------------------------------------------------
// Decoder strategies
// ---------------------------------------------------------------------------

/// One way of turning stored bytes back into an event.
pub trait PayloadDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// `log_id` is the key the payload was stored under; decoders use it when
    /// the payload itself does not carry one.
    fn decode(&self, log_id: &str, bytes: &[u8]) -> Result<ActivityEvent>;
}

fn decode_err(log_id: &str, reason: impl Into<String>) -> TallyError {
    TallyError::Decode {
        log_id: log_id.to_string(),
        reason: reason.into(),
    }
}

pub struct EnvelopeDecoder;

impl PayloadDecoder for EnvelopeDecoder {
    fn name(&self) -> &'static str {
        "envelope"
    }

    fn decode(&self, log_id: &str, bytes: &[u8]) -> Result<ActivityEvent> {
        let env: Envelope =
            serde_json::from_slice(bytes).map_err(|e| decode_err(log_id, e.to_string()))?;
        if env.v != ENVELOPE_VERSION {
            return Err(decode_err(
                log_id,
                format!("unsupported envelope version {}", env.v),
            ));
        }
        Ok(env.event)
    }
}

pub struct LegacyJsonDecoder;

impl PayloadDecoder for LegacyJsonDecoder {
    fn name(&self) -> &'static str {
        "legacy_json"
    }

    fn decode(&self, log_id: &str, bytes: &[u8]) -> Result<ActivityEvent> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| decode_err(log_id, e.to_string()))?;
        let Value::Object(obj) = value else {
            return Err(decode_err(log_id, "payload is not a JSON object"));
        };
        from_loose_object(log_id, &obj)
    }
}

pub struct RawBytesDecoder;

impl PayloadDecoder for RawBytesDecoder {
    fn name(&self) -> &'static str {
        "raw_bytes"
    }

    fn decode(&self, log_id: &str, bytes: &[u8]) -> Result<ActivityEvent> {
        let text = String::from_utf8_lossy(bytes);
        let start = text
            .find(['{', '['])
            .ok_or_else(|| decode_err(log_id, "no JSON structure in payload"))?;
        let end = text
            .rfind(['}', ']'])
            .filter(|&end| end > start)
            .ok_or_else(|| decode_err(log_id, "unterminated JSON structure"))?;
        let value: Value = serde_json::from_str(&text[start..=end])
            .map_err(|e| decode_err(log_id, e.to_string()))?;

        // Type-tagged arrays look like `["com.example.ActivityLog", {...}]`.
        let obj = match value {
            Value::Object(obj) => obj,
            Value::Array(items) => items
                .into_iter()
                .find_map(|v| match v {
                    Value::Object(obj) => Some(obj),
                    _ => None,
                })
                .ok_or_else(|| decode_err(log_id, "type-tagged array has no object"))?,
            _ => return Err(decode_err(log_id, "payload is not an object")),
        };
        from_loose_object(log_id, &obj)
    }
}

// ---------------------------------------------------------------------------
// DecoderChain
// ---------------------------------------------------------------------------

/// Ordered list of decoders tried in sequence.
pub struct DecoderChain {
    decoders: Vec<Box<dyn PayloadDecoder>>,
}

impl Default for DecoderChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(EnvelopeDecoder),
            Box::new(LegacyJsonDecoder),
            Box::new(RawBytesDecoder),
        ])
    }
}

impl DecoderChain {
    pub fn new(decoders: Vec<Box<dyn PayloadDecoder>>) -> Self {
        Self { decoders }
    }

    pub fn decode(&self, log_id: &str, bytes: &[u8]) -> Result<ActivityEvent> {
        let mut last_err = decode_err(log_id, "no decoders configured");
        for decoder in &self.decoders {
            match decoder.decode(log_id, bytes) {
                Ok(event) => {
                    tracing::trace!(log_id, decoder = decoder.name(), "payload decoded");
                    return Ok(event);
                }
                Err(e) => {
                    tracing::trace!(log_id, decoder = decoder.name(), error = %e, "decoder declined");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

// ---------------------------------------------------------------------------
// Loose field extraction
// ---------------------------------------------------------------------------

fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|n| obj.get(*n))
        .find(|v| !v.is_null())
}

fn loose_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn loose_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_u64(v: &Value) -> Option<u64> {
    loose_i64(v).and_then(|n| u64::try_from(n).ok())
}

/// Accepts epoch milliseconds, RFC 3339, or `yyyy-MM-dd HH:mm:ss` (UTC).
fn loose_time(v: &Value) -> Option<DateTime<Utc>> {
    if let Some(ms) = v.as_i64() {
        return Utc.timestamp_millis_opt(ms).single();
    }
    let s = v.as_str()?.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Utc.timestamp_millis_opt(ms).single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn from_loose_object(log_id: &str, obj: &Map<String, Value>) -> Result<ActivityEvent> {
    let stored_id = field(obj, &["logId", "log_id", "id"]).and_then(loose_str);
    let action_type = field(obj, &["actionType", "action_type", "action"])
        .and_then(loose_str)
        .ok_or_else(|| decode_err(log_id, "missing action type"))?;
    let created_at = field(obj, &["createdAt", "created_at", "createTime"])
        .and_then(loose_time)
        .ok_or_else(|| decode_err(log_id, "missing or unreadable creation time"))?;
    let updated_at = field(obj, &["updatedAt", "updated_at", "updateTime"])
        .and_then(loose_time)
        .unwrap_or(created_at);

    let meta = match field(obj, &["meta", "metadata", "extra"]) {
        Some(Value::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
        }
        Some(other) => other.clone(),
        None => Value::Null,
    };

    let get_str = |names: &[&str]| field(obj, names).and_then(loose_str);
    let get_u64 = |names: &[&str]| field(obj, names).and_then(loose_u64);
    // Legacy writers used 0 for "none".
    let get_id = |names: &[&str]| {
        field(obj, names)
            .and_then(loose_u64)
            .filter(|&id| id != 0)
    };

    Ok(ActivityEvent {
        log_id: stored_id.unwrap_or_else(|| log_id.to_string()),
        actor_id: get_id(&["userId", "actorId", "actor_id"]),
        region_id: get_id(&["regionId", "region_id"]),
        action_type: normalize_action_type(action_type),
        target_ref: get_id(&["targetId", "targetRef", "target_ref"]),
        parent_ref: get_id(&["parentId", "parentRef", "parent_ref"]),
        action_value: get_str(&["actionValue", "action_value"]),
        score_delta: field(obj, &["scoreDelta", "score", "score_delta"])
            .and_then(loose_i64)
            .unwrap_or(0),
        meta,
        origin: Origin {
            ip: get_str(&["ip", "ipAddress", "clientIp"]),
            agent: get_str(&["agent", "userAgent", "user_agent"]),
            platform: get_str(&["platform"]),
            locale: get_str(&["locale", "lang"]),
        },
        priority: get_str(&["priority"])
            .and_then(|p| p.parse().ok())
            .unwrap_or(Priority::Normal),
        status: get_str(&["status"])
            .and_then(|s| s.parse().ok())
            .unwrap_or(EventStatus::Success),
        error: get_str(&["errorMsg", "error", "errorMessage"]),
        created_at,
        updated_at,
        duration_ms: get_u64(&["executionTime", "durationMs", "duration_ms"]).unwrap_or(0),
        ttl_secs: get_u64(&["ttl", "ttlSecs", "ttl_secs"]),
    })
}
