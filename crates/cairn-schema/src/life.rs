use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state shared by machines, services, units and relations.
///
/// Values only ever move forward: `Alive -> Dying -> Dead`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn as_str(self) -> &'static str {
        match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        }
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Life {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alive" | "Alive" => Ok(Life::Alive),
            "dying" | "Dying" => Ok(Life::Dying),
            "dead" | "Dead" => Ok(Life::Dead),
            other => Err(format!("unknown life \"{other}\"")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn life_is_ordered() {
        assert!(Life::Alive < Life::Dying);
        assert!(Life::Dying < Life::Dead);
    }

    #[test]
    fn life_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Life::Dying).unwrap(), "\"dying\"");
        let back: Life = serde_json::from_str("\"dead\"").unwrap();
        assert_eq!(back, Life::Dead);
    }

    #[test]
    fn life_parse() {
        assert_eq!("Alive".parse::<Life>().unwrap(), Life::Alive);
        assert!("zombie".parse::<Life>().is_err());
    }
}
