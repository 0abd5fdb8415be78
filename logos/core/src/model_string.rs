//! Model String Parser
//!
//! Requests name their model with a structured string instead of a model id:
//!
//! ```text
//! logos-v1__policy_default=false_privacy=CLOUD_IN_EU_BY_EU_PROVIDER__latency=5__policy=fast
//! └──┬───┘ └───────────────────────┬─────────────────────────────┘ └───┬───┘ └────┬────┘
//!  version              policy segment (`_`-joined pairs)        policy key    extra
//! ```
//!
//! Segments are separated by `__`. Inside a `policy_` segment, pairs are
//! separated by `_`; a fragment without `=` continues the previous value, so
//! enum values with underscores survive.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::classification::PrivacyTier;

/// Required prefix
pub const MODEL_STRING_PREFIX: &str = "logos-v";

/// Keys accepted in the policy map
pub const POLICY_KEYS: [&str; 6] = ["default", "privacy", "cost", "latency", "accuracy", "quality"];

/// Extra keys kept after parsing; everything else is dropped
pub const EXTRA_ALLOW_LIST: [&str; 1] = ["policy"];

const NUMERIC_KEYS: [&str; 4] = ["cost", "latency", "accuracy", "quality"];

/// Model string errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelStringError {
    /// Structure is wrong (prefix, separators, pairs)
    #[error("malformed model string: {0}")]
    Syntax(String),

    /// A key or value is not acceptable
    #[error("invalid value for '{key}': {value}")]
    InvalidValue {
        /// Offending key
        key: String,
        /// Offending value
        value: String,
    },

    /// A required attribute is absent
    #[error("missing attribute: {0}")]
    MissingAttribute(String),
}

/// Result of parsing a model string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModelString {
    /// Version after the prefix
    pub version: String,
    /// Policy map, always containing `default`
    pub policy: BTreeMap<String, String>,
    /// Allow-listed extras
    pub extra: BTreeMap<String, String>,
}

impl ParsedModelString {
    /// Whether the request builds on the default policy
    #[must_use]
    pub fn uses_default_policy(&self) -> bool {
        self.policy.get("default").map_or(true, |v| v == "true")
    }

    /// Policy value by key
    #[must_use]
    pub fn policy_value(&self, key: &str) -> Option<&str> {
        self.policy.get(key).map(String::as_str)
    }

    /// Policy overrides (everything but `default`)
    pub fn overrides(&self) -> impl Iterator<Item = (&str, &str)> {
        self.policy
            .iter()
            .filter(|(k, _)| k.as_str() != "default")
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl std::str::FromStr for ParsedModelString {
    type Err = ModelStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse a model string
pub fn parse(s: &str) -> Result<ParsedModelString, ModelStringError> {
    let rest = s.trim().strip_prefix(MODEL_STRING_PREFIX).ok_or_else(|| {
        ModelStringError::Syntax(format!("expected prefix '{MODEL_STRING_PREFIX}'"))
    })?;

    let mut segments = rest.split("__");
    let version = segments.next().unwrap_or_default();
    if version.is_empty() {
        return Err(ModelStringError::Syntax("missing version".into()));
    }

    let mut policy = BTreeMap::from([("default".to_string(), "true".to_string())]);
    let mut extra = BTreeMap::new();

    for segment in segments {
        if segment.is_empty() {
            return Err(ModelStringError::Syntax("empty segment".into()));
        }
        if let Some(body) = segment.strip_prefix("policy_") {
            for (key, value) in split_policy_pairs(body)? {
                insert_policy(&mut policy, &key, value)?;
            }
            continue;
        }

        let (key, value) = split_pair(segment)?;
        if POLICY_KEYS.contains(&key) {
            insert_policy(&mut policy, key, value.to_string())?;
        } else {
            extra.insert(key.to_string(), value.to_string());
        }
    }

    match policy.get("default").map(String::as_str) {
        Some("true") => {}
        Some("false") => {
            if policy.len() == 1 {
                return Err(ModelStringError::MissingAttribute(
                    "default=false requires at least one policy override".into(),
                ));
            }
        }
        other => {
            return Err(ModelStringError::InvalidValue {
                key: "default".into(),
                value: other.unwrap_or_default().to_string(),
            })
        }
    }

    extra.retain(|key, _| {
        let keep = EXTRA_ALLOW_LIST.contains(&key.as_str());
        if !keep {
            tracing::debug!(key = %key, "Dropping unrecognised model string extra");
        }
        keep
    });

    Ok(ParsedModelString {
        version: version.to_string(),
        policy,
        extra,
    })
}

fn split_pair(segment: &str) -> Result<(&str, &str), ModelStringError> {
    match segment.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() && !value.contains('=') => {
            Ok((key, value))
        }
        _ => Err(ModelStringError::Syntax(format!("expected key=value, got '{segment}'"))),
    }
}

fn split_policy_pairs(body: &str) -> Result<Vec<(String, String)>, ModelStringError> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for fragment in body.split('_') {
        if fragment.contains('=') {
            let (key, value) = split_pair(fragment)?;
            pairs.push((key.to_string(), value.to_string()));
        } else if let (Some((_, value)), false) = (pairs.last_mut(), fragment.is_empty()) {
            value.push('_');
            value.push_str(fragment);
        } else {
            return Err(ModelStringError::Syntax(format!(
                "dangling fragment '{fragment}' in policy segment"
            )));
        }
    }
    if pairs.is_empty() {
        return Err(ModelStringError::Syntax("empty policy segment".into()));
    }
    Ok(pairs)
}

fn insert_policy(
    policy: &mut BTreeMap<String, String>,
    key: &str,
    value: String,
) -> Result<(), ModelStringError> {
    let invalid = |value: &str| ModelStringError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    };

    let value = match key {
        "default" => match value.as_str() {
            "true" | "false" => value,
            _ => return Err(invalid(&value)),
        },
        "privacy" => value
            .parse::<PrivacyTier>()
            .map_err(|_| invalid(&value))?
            .as_str()
            .to_string(),
        k if NUMERIC_KEYS.contains(&k) => match value.parse::<f64>() {
            Ok(n) if n.is_finite() => value,
            _ => return Err(invalid(&value)),
        },
        _ => return Err(invalid(&value)),
    };
    policy.insert(key.to_string(), value);
    Ok(())
}
