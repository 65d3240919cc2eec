//! Typed lookup of string parameters
//!
//! Engine, transport and operator settings are plain `String → String` maps.
//! These helpers read one key with a type: a missing key is `Ok(None)`, a
//! present but unparsable value is [`AdaptioError::InvalidParameter`]. Keys
//! match case-insensitively.

use crate::error::{AdaptioError, Result};
use crate::types::Params;
use std::str::FromStr;
use std::time::Duration;

fn lookup<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .or_else(|| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
        .map(|v| v.trim())
}

fn invalid(key: &str, value: &str) -> AdaptioError {
    AdaptioError::InvalidParameter {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_with<T: FromStr>(params: &Params, key: &str) -> Result<Option<T>> {
    match lookup(params, key) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| invalid(key, value)),
    }
}

/// Interpret `true/false/on/off/yes/no/1/0` (any case)
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Interpret a byte size with an optional binary unit (`64KiB`, `1Gb`, `512`)
pub fn parse_byte_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let base: usize = digits.parse().ok()?;
    let multiplier: usize = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        _ => return None,
    };
    base.checked_mul(multiplier)
}

pub fn get_string<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    lookup(params, key).filter(|v| !v.is_empty())
}

pub fn get_bool(params: &Params, key: &str) -> Result<Option<bool>> {
    match lookup(params, key) {
        None => Ok(None),
        Some(value) => parse_bool(value)
            .map(Some)
            .ok_or_else(|| invalid(key, value)),
    }
}

pub fn get_int(params: &Params, key: &str) -> Result<Option<i64>> {
    parse_with(params, key)
}

pub fn get_usize(params: &Params, key: &str) -> Result<Option<usize>> {
    parse_with(params, key)
}

/// Byte size, accepting the units of [`parse_byte_size`]
pub fn get_byte_size(params: &Params, key: &str) -> Result<Option<usize>> {
    match lookup(params, key) {
        None => Ok(None),
        Some(value) => parse_byte_size(value)
            .map(Some)
            .ok_or_else(|| invalid(key, value)),
    }
}

/// Millisecond count as a [`Duration`]
pub fn get_duration_ms(params: &Params, key: &str) -> Result<Option<Duration>> {
    Ok(parse_with::<u64>(params, key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_bool_spellings() {
        for yes in ["true", "On", "YES", "1"] {
            assert_eq!(parse_bool(yes), Some(true));
        }
        for no in ["false", "off", "No", "0"] {
            assert_eq!(parse_bool(no), Some(false));
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_missing_and_invalid() {
        let p = params(&[("monitor", "sometimes"), ("transport_channels", "x")]);
        assert_eq!(get_bool(&p, "absent").unwrap(), None);
        assert!(matches!(
            get_bool(&p, "monitor"),
            Err(AdaptioError::InvalidParameter { .. })
        ));
        assert!(get_usize(&p, "transport_channels").is_err());
    }

    #[test]
    fn test_case_insensitive_keys() {
        let p = params(&[("WorkflowMode", "synchronous"), ("DrainIntervalMs", "250")]);
        assert_eq!(get_string(&p, "workflowmode"), Some("synchronous"));
        assert_eq!(
            get_duration_ms(&p, "drainintervalms").unwrap(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_byte_sizes() {
        assert_eq!(parse_byte_size("512"), Some(512));
        assert_eq!(parse_byte_size("64KiB"), Some(64 * 1024));
        assert_eq!(parse_byte_size("1Gb"), Some(1 << 30));
        assert_eq!(parse_byte_size("3 mb"), Some(3 << 20));
        assert_eq!(parse_byte_size("lots"), None);
        assert_eq!(parse_byte_size("5TB"), None);

        let p = params(&[("buffer_size", "2MiB")]);
        assert_eq!(get_byte_size(&p, "buffer_size").unwrap(), Some(2 << 20));
    }

    #[test]
    fn test_get_int_and_empty_string() {
        let p = params(&[("rank", "-3"), ("address", "")]);
        assert_eq!(get_int(&p, "rank").unwrap(), Some(-3));
        assert_eq!(get_string(&p, "address"), None);
    }
}
