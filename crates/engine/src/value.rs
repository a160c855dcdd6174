//! Ground literals exchanged with the outside world.
//!
//! Inside the engine every valuation is an SMT term; test cases and the
//! simulator speak in plain literals, serialized as `true`/`false` or
//! decimal text.

use std::fmt;
use std::str::FromStr;

/// A ground boolean or integer literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Bool(bool),
    Int(i64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "{}", value),
            Value::Int(value) => write!(f, "{}", value),
        }
    }
}

impl FromStr for Value {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => text
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| format!("not a literal: {} ({})", text, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for value in [Value::Bool(true), Value::Bool(false), Value::Int(-17), Value::Int(0)] {
            let text = value.to_string();
            assert_eq!(text.parse::<Value>().unwrap(), value);
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("TRUE".parse::<Value>().is_err());
        assert!("1.5".parse::<Value>().is_err());
    }
}
