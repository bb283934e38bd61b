/// Chain-spec JSON parsing: `engine.authorityRound.params.validators`.
///
/// The multi-map's keys are block-number strings; values are one of
/// `{"list": [...]}`, `{"safeContract": addr}`, or `{"contract": addr}`.
/// Keys are sorted numerically to derive non-overlapping ranges; the last
/// range is open-ended.
use serde_json::Value;
use std::path::Path;

use crate::error::MonitorError;
use crate::types::{Address, ValidatorRange, ValidatorSource};

pub fn load_validator_ranges(path: &Path) -> Result<Vec<ValidatorRange>, MonitorError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| MonitorError::InvalidData(format!("reading chain spec {path:?}: {e}")))?;
    parse_validator_ranges(&raw)
}

pub fn parse_validator_ranges(raw: &str) -> Result<Vec<ValidatorRange>, MonitorError> {
    let doc: Value = serde_json::from_str(raw)
        .map_err(|e| MonitorError::InvalidData(format!("chain spec is not valid JSON: {e}")))?;

    let validators_map = doc
        .pointer("/engine/authorityRound/params/validators")
        .ok_or_else(|| {
            MonitorError::InvalidData(
                "chain spec missing engine.authorityRound.params.validators".into(),
            )
        })?
        .as_object()
        .ok_or_else(|| MonitorError::InvalidData("validators must be an object".into()))?;

    let mut starts: Vec<(u64, &Value)> = Vec::with_capacity(validators_map.len());
    for (key, value) in validators_map {
        let height: u64 = key
            .parse()
            .map_err(|_| MonitorError::InvalidData(format!("non-numeric validator key {key}")))?;
        starts.push((height, value));
    }
    starts.sort_by_key(|(h, _)| *h);

    if starts.is_empty() {
        return Err(MonitorError::InvalidData(
            "chain spec defines no validator ranges".into(),
        ));
    }

    let mut ranges = Vec::with_capacity(starts.len());
    for (idx, (height, value)) in starts.iter().enumerate() {
        let end_height = starts.get(idx + 1).map(|(h, _)| *h);
        let source = parse_source(value)?;
        ranges.push(ValidatorRange {
            start_height: *height,
            end_height,
            source,
        });
    }
    Ok(ranges)
}

fn parse_source(value: &Value) -> Result<ValidatorSource, MonitorError> {
    if let Some(list) = value.get("list").and_then(Value::as_array) {
        let addrs = list
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| MonitorError::InvalidData("validator entry not a string".into()))
                    .and_then(Address::from_hex)
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(ValidatorSource::List(addrs));
    }
    if let Some(addr) = value.get("safeContract").and_then(Value::as_str) {
        return Ok(ValidatorSource::Contract(Address::from_hex(addr)?));
    }
    if let Some(addr) = value.get("contract").and_then(Value::as_str) {
        return Ok(ValidatorSource::Contract(Address::from_hex(addr)?));
    }
    Err(MonitorError::InvalidData(
        "validator range is neither list, safeContract, nor contract".into(),
    ))
}

/// Governing range for a given height, or `None` if `height` precedes the
/// first range (should not happen for a well-formed chain spec).
pub fn range_for_height(ranges: &[ValidatorRange], height: u64) -> Option<&ValidatorRange> {
    ranges
        .iter()
        .filter(|r| r.start_height <= height)
        .max_by_key(|r| r.start_height)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"{
        "engine": {
            "authorityRound": {
                "params": {
                    "validators": {
                        "0": { "list": ["0x1000000000000000000000000000000000000001", "0x1000000000000000000000000000000000000002"] },
                        "1000": { "safeContract": "0x2000000000000000000000000000000000000001" }
                    }
                }
            }
        }
    }"#;

    #[test]
    fn parses_ranges_sorted_with_open_ended_last() {
        let ranges = parse_validator_ranges(SPEC).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start_height, 0);
        assert_eq!(ranges[0].end_height, Some(1000));
        assert!(matches!(ranges[0].source, ValidatorSource::List(ref v) if v.len() == 2));
        assert_eq!(ranges[1].start_height, 1000);
        assert_eq!(ranges[1].end_height, None);
        assert!(matches!(ranges[1].source, ValidatorSource::Contract(_)));
    }

    #[test]
    fn range_for_height_picks_greatest_start_leq_height() {
        let ranges = parse_validator_ranges(SPEC).unwrap();
        let r = range_for_height(&ranges, 1500).unwrap();
        assert_eq!(r.start_height, 1000);
        let r = range_for_height(&ranges, 500).unwrap();
        assert_eq!(r.start_height, 0);
    }

    #[test]
    fn rejects_missing_validators_key() {
        let err = parse_validator_ranges("{}").unwrap_err();
        assert!(matches!(err, MonitorError::InvalidData(_)));
    }
}
