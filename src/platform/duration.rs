//! CLI duration values such as "250ms", "30s", "5m" or "2h".

use std::str::FromStr;
use std::time::Duration;

use crate::{BpfuzzError, BpfuzzResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzDuration(pub Duration);

impl FromStr for FuzzDuration {
    type Err = BpfuzzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}

pub fn parse_duration(input: &str) -> BpfuzzResult<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(BpfuzzError::InvalidArgument("empty duration".to_string()));
    }

    let (num_part, unit_part) = split_num_unit(s)?;
    let value: u64 = num_part.parse().map_err(|_| {
        BpfuzzError::InvalidArgument(format!("invalid duration number: {num_part} (from {input:?})"))
    })?;

    match unit_part {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(3600))),
        _ => Err(BpfuzzError::InvalidArgument(format!(
            "invalid duration unit {unit_part:?} (expected ms|s|m|h)"
        ))),
    }
}

fn split_num_unit(s: &str) -> BpfuzzResult<(&str, &str)> {
    let idx = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if idx == 0 {
        return Err(BpfuzzError::InvalidArgument(format!("invalid duration {s:?} (missing number)")));
    }
    if idx == s.len() {
        return Err(BpfuzzError::InvalidArgument(format!(
            "invalid duration {s:?} (missing unit; expected ms|s|m|h)"
        )));
    }
    Ok(s.split_at(idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_examples() {
        assert_eq!(parse_duration("250ms").expect("ms"), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").expect("s"), Duration::from_secs(30));
        assert_eq!(parse_duration(" 5m ").expect("m"), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").expect("h"), Duration::from_secs(7200));
    }

    #[test]
    fn rejects_missing_parts() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("15").is_err());
        assert!(parse_duration("3d").is_err());
        assert!("10s".parse::<FuzzDuration>().is_ok());
    }
}
