//! Timestamp validation and repair.
//!
//! Timestamps arrive from callers and from the remote store in several
//! shapes: RFC 3339 strings, epoch milliseconds, or the remote store's
//! native `{ "seconds", "nanoseconds" }` object. Anything that does not
//! parse, or lands outside `[1970-01-01, 2100-01-01)`, is replaced with
//! the current time instead of being rejected.

use chrono::{DateTime, Datelike, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

use crate::types::Document;

/// Field holding a record's creation time.
pub const CREATED_AT: &str = "createdAt";

/// First year that is considered absurdly far in the future.
pub const MAX_YEAR: i32 = 2100;

/// Parse a timestamp value without checking its range.
pub fn parse(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_str(s),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        Value::Object(map) => {
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, u32::try_from(nanos).ok()?).single()
        }
        _ => None,
    }
}

fn parse_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Check that a timestamp lies in the sane calendar range.
pub fn is_in_range(dt: &DateTime<Utc>) -> bool {
    dt.timestamp_millis() >= 0 && dt.year() < MAX_YEAR
}

/// Parse and range-check a timestamp value.
pub fn validate(value: &Value) -> Option<DateTime<Utc>> {
    parse(value).filter(is_in_range)
}

/// Return a valid timestamp for `value`, substituting `now` when the value
/// is missing, malformed or out of range.
///
/// The second element is `true` when a substitution happened.
pub fn normalize(value: Option<&Value>, now: DateTime<Utc>) -> (DateTime<Utc>, bool) {
    match value.and_then(validate) {
        Some(dt) => (dt, false),
        None => (now, true),
    }
}

/// Canonical document representation of a timestamp.
pub fn to_value(dt: &DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Repair the timestamp fields of a document in place.
///
/// `createdAt` is always made present and valid. Every other name in
/// `fields` is only touched when present. Valid values are rewritten into
/// the canonical form; invalid ones become `now`.
///
/// Returns the names of the fields that had to be substituted.
pub fn normalize_fields(doc: &mut Document, fields: &[String], now: DateTime<Utc>) -> Vec<String> {
    let mut repaired = Vec::new();

    let names = std::iter::once(CREATED_AT).chain(
        fields
            .iter()
            .map(String::as_str)
            .filter(|name| *name != CREATED_AT),
    );

    for name in names {
        let current = doc.get(name);
        if current.is_none() && name != CREATED_AT {
            continue;
        }
        let (dt, substituted) = normalize(current, now);
        if substituted {
            repaired.push(name.to_string());
        }
        doc.insert(name.to_string(), to_value(&dt));
    }

    repaired
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_parse_rfc3339() {
        let dt = validate(&json!("2024-03-01T12:30:00Z")).unwrap();
        assert_eq!(dt.year(), 2024);
    }

    #[test]
    fn test_parse_plain_date() {
        let dt = validate(&json!("2023-07-15")).unwrap();
        assert_eq!(dt.month(), 7);
    }

    #[test]
    fn test_parse_epoch_millis() {
        let dt = validate(&json!(1_700_000_000_000i64)).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_native_timestamp_object() {
        let dt = validate(&json!({ "seconds": 1_700_000_000, "nanoseconds": 5 })).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(validate(&json!("not-a-date")).is_none());
        assert!(validate(&json!(true)).is_none());
        assert!(validate(&Value::Null).is_none());
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(validate(&json!("1969-12-31T23:59:59Z")).is_none());
        assert!(validate(&json!("2100-01-01T00:00:00Z")).is_none());
        assert!(validate(&json!(-1)).is_none());
    }

    #[test]
    fn test_normalize_substitutes_now() {
        let now = Utc::now();
        let (dt, repaired) = normalize(Some(&json!("not-a-date")), now);
        assert!(repaired);
        assert_eq!(dt, now);

        let (_, repaired) = normalize(None, now);
        assert!(repaired);
    }

    #[test]
    fn test_normalize_keeps_valid() {
        let now = Utc::now();
        let (dt, repaired) = normalize(Some(&json!("2020-01-01T00:00:00Z")), now);
        assert!(!repaired);
        assert_eq!(dt.year(), 2020);
    }

    #[test]
    fn test_to_value_round_trips() {
        let now = Utc::now();
        let value = to_value(&now);
        let parsed = validate(&value).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_normalize_fields() {
        let now = Utc::now();
        let mut doc = Document::new();
        doc.insert("createdAt".to_string(), json!("not-a-date"));
        doc.insert("lastLogin".to_string(), json!("2022-05-05T10:00:00+02:00"));
        doc.insert("email".to_string(), json!("a@b.com"));

        let names = vec!["updatedAt".to_string(), "lastLogin".to_string()];
        let repaired = normalize_fields(&mut doc, &names, now);

        assert_eq!(repaired, vec!["createdAt".to_string()]);
        assert_eq!(doc.get("createdAt"), Some(&to_value(&now)));
        assert_eq!(doc.get("lastLogin"), Some(&json!("2022-05-05T08:00:00.000Z")));
        assert!(doc.get("updatedAt").is_none());
        assert_eq!(doc.get("email"), Some(&json!("a@b.com")));
    }

    #[test]
    fn test_normalize_fields_adds_missing_created_at() {
        let now = Utc::now();
        let mut doc = Document::new();
        let repaired = normalize_fields(&mut doc, &[], now);
        assert_eq!(repaired, vec!["createdAt".to_string()]);
        assert!(doc.get("createdAt").and_then(validate).is_some());
    }

    proptest! {
        #[test]
        fn normalized_timestamps_are_always_in_range(millis in any::<i64>(), text in ".*") {
            let now = Utc::now();
            for value in [json!(millis), json!(text)] {
                let (dt, _) = normalize(Some(&value), now);
                prop_assert!(is_in_range(&dt));
            }
        }
    }
}
