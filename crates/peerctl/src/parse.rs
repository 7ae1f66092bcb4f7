//! Flag value parsers: cpu cores, memory sizes, env pairs, durations.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::CliError;

/// Parse a CPU allocation in cores ("0.5", "2") into millicores.
pub fn parse_cpu(s: &str) -> Result<i64, CliError> {
    let cores: f64 = s
        .parse()
        .map_err(|_| CliError::User(format!("invalid cpu value: {s}")))?;
    if cores <= 0.0 || !cores.is_finite() {
        return Err(CliError::User(format!("cpu must be positive: {s}")));
    }
    Ok((cores * 1000.0).round() as i64)
}

/// Parse a memory size with an optional K/M/G suffix ("256M", "1G", "1024")
/// into bytes. Bare numbers are bytes.
pub fn parse_memory(s: &str) -> Result<i64, CliError> {
    let s = s.trim();
    let (number, multiplier) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024i64),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| CliError::User(format!("invalid memory value: {s}")))?;
    if value <= 0.0 || !value.is_finite() {
        return Err(CliError::User(format!("memory must be positive: {s}")));
    }
    Ok((value * multiplier as f64) as i64)
}

/// Parse repeated `KEY=VALUE` pairs.
pub fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| CliError::User(format!("invalid env var (expected KEY=VALUE): {pair}")))?;
        if key.is_empty() {
            return Err(CliError::User(format!("empty env var name: {pair}")));
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// Parse a duration with an s/m/h suffix ("30s", "5m"); bare numbers are
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration, CliError> {
    let s = s.trim();
    let (number, unit) = match s.chars().last() {
        Some('s') => (&s[..s.len() - 1], 1u64),
        Some('m') => (&s[..s.len() - 1], 60),
        Some('h') => (&s[..s.len() - 1], 3600),
        _ => (s, 1),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| CliError::User(format!("invalid duration: {s}")))?;
    Ok(Duration::from_secs(value * unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu("0.5").unwrap(), 500);
        assert_eq!(parse_cpu("2").unwrap(), 2000);
        assert_eq!(parse_cpu("0.25").unwrap(), 250);
        assert!(parse_cpu("-1").is_err());
        assert!(parse_cpu("lots").is_err());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("256M").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory("1.5G").unwrap(), (1.5 * 1073741824.0) as i64);
        assert!(parse_memory("zero").is_err());
        assert!(parse_memory("-5M").is_err());
    }

    #[test]
    fn test_parse_env() {
        let env = parse_env(&["A=1".into(), "B=two=three".into()]).unwrap();
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("two=three"));
        assert!(parse_env(&["NOEQUALS".into()]).is_err());
        assert!(parse_env(&["=value".into()]).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("soon").is_err());
    }
}
