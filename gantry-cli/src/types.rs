//! Argument types and parsers shared by the command modules

use serde::de::DeserializeOwned;
use std::fmt;
use uuid::Uuid;

/// Identifier that can be either a full UUID or an unambiguous prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdOrPrefix {
    Full(Uuid),
    Prefix(String),
}

impl IdOrPrefix {
    /// Parses a full UUID, otherwise keeps the input as a lowercase prefix
    pub fn parse(input: &str) -> Self {
        match Uuid::parse_str(input) {
            Ok(uuid) => IdOrPrefix::Full(uuid),
            Err(_) => IdOrPrefix::Prefix(input.trim().to_lowercase()),
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            IdOrPrefix::Full(uuid) => Some(*uuid),
            IdOrPrefix::Prefix(_) => None,
        }
    }

    /// Whether `id` is the referenced UUID or starts with the prefix
    pub fn matches(&self, id: Uuid) -> bool {
        match self {
            IdOrPrefix::Full(uuid) => *uuid == id,
            IdOrPrefix::Prefix(prefix) => id.to_string().starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for IdOrPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdOrPrefix::Full(uuid) => write!(f, "{}", uuid),
            IdOrPrefix::Prefix(prefix) => write!(f, "{}", prefix),
        }
    }
}

/// Parse a single key=value pair
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    if key.is_empty() {
        return Err(format!("invalid KEY=value: empty key in `{}`", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Parse a snake_case enum value such as `branch_updated` or `dead`
///
/// Accepts dashes in place of underscores.
pub fn parse_name<T: DeserializeOwned>(s: &str) -> Result<T, String> {
    let name = s.trim().replace('-', "_");
    serde_json::from_value(serde_json::Value::String(name))
        .map_err(|_| format!("unknown value `{}`", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::domain::job::JobState;
    use gantry_core::domain::webhook::WebhookTrigger;

    #[test]
    fn test_id_or_prefix() {
        let id = Uuid::new_v4();
        assert_eq!(IdOrPrefix::parse(&id.to_string()), IdOrPrefix::Full(id));
        assert!(IdOrPrefix::parse(&id.to_string()).matches(id));

        let prefix = IdOrPrefix::parse(&id.to_string()[..6].to_uppercase());
        assert!(prefix.as_uuid().is_none());
        assert!(prefix.matches(id));
        assert!(!IdOrPrefix::parse("zzz").matches(id));
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("target=prod").unwrap(),
            ("target".to_string(), "prod".to_string())
        );
        assert_eq!(
            parse_key_val("query=a=b").unwrap(),
            ("query".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_key_val("empty=").unwrap(),
            ("empty".to_string(), String::new())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_parse_name() {
        assert_eq!(parse_name::<JobState>("dead").unwrap(), JobState::Dead);
        assert_eq!(
            parse_name::<WebhookTrigger>("execution-completed").unwrap(),
            WebhookTrigger::ExecutionCompleted
        );
        assert!(parse_name::<JobState>("sleeping").is_err());
    }
}
