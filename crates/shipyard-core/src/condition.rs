use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Composite levels allowed below the root condition.
pub const MAX_CONDITION_DEPTH: usize = 2;

/// An entity that conditions can be evaluated against.
///
/// Attributes an entity does not carry return `None` and never match.
pub trait Selectable {
    fn id(&self) -> &str;

    fn name(&self) -> Option<&str> {
        None
    }

    fn kind(&self) -> Option<&str> {
        None
    }

    fn identifier(&self) -> Option<&str> {
        None
    }

    fn version(&self) -> Option<&str> {
        None
    }

    fn metadata_value(&self, _key: &str) -> Option<&str> {
        None
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonOperator {
    And,
    Or,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StringOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    Null,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateOperator {
    Before,
    After,
    BeforeOrOn,
    AfterOrOn,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Condition {
    Id {
        value: String,
    },
    Kind {
        value: String,
    },
    Name {
        operator: StringOperator,
        value: String,
    },
    Identifier {
        operator: StringOperator,
        value: String,
    },
    Version {
        operator: StringOperator,
        value: String,
    },
    Metadata {
        key: String,
        operator: MetadataOperator,
        #[serde(default)]
        value: Option<String>,
    },
    CreatedAt {
        operator: DateOperator,
        value: DateTime<Utc>,
    },
    UpdatedAt {
        operator: DateOperator,
        value: DateTime<Utc>,
    },
    Comparison {
        operator: ComparisonOperator,
        #[serde(default)]
        not: bool,
        conditions: Vec<Condition>,
    },
}

fn match_string(operator: StringOperator, actual: &str, expected: &str) -> bool {
    match operator {
        StringOperator::Equals => actual == expected,
        StringOperator::Contains => actual
            .to_lowercase()
            .contains(&expected.to_lowercase()),
        StringOperator::StartsWith => actual.starts_with(expected),
        StringOperator::EndsWith => actual.ends_with(expected),
        StringOperator::Regex => match Regex::new(expected) {
            Ok(regex) => regex.is_match(actual),
            Err(_) => false,
        },
    }
}

fn match_optional_string(operator: StringOperator, actual: Option<&str>, expected: &str) -> bool {
    match actual {
        Some(actual) => match_string(operator, actual, expected),
        None => false,
    }
}

fn match_date(operator: DateOperator, actual: Option<DateTime<Utc>>, expected: &DateTime<Utc>) -> bool {
    let actual = match actual {
        Some(actual) => actual,
        None => return false,
    };

    match operator {
        DateOperator::Before => actual < *expected,
        DateOperator::After => actual > *expected,
        DateOperator::BeforeOrOn => actual <= *expected,
        DateOperator::AfterOrOn => actual >= *expected,
    }
}

impl MetadataOperator {
    fn as_string_operator(&self) -> Option<StringOperator> {
        match self {
            MetadataOperator::Equals => Some(StringOperator::Equals),
            MetadataOperator::Contains => Some(StringOperator::Contains),
            MetadataOperator::StartsWith => Some(StringOperator::StartsWith),
            MetadataOperator::EndsWith => Some(StringOperator::EndsWith),
            MetadataOperator::Regex => Some(StringOperator::Regex),
            MetadataOperator::Null => None,
        }
    }
}

impl Condition {
    pub fn matches(&self, entity: &dyn Selectable) -> bool {
        match self {
            Condition::Id { value } => entity.id() == value,
            Condition::Kind { value } => entity.kind() == Some(value.as_str()),
            Condition::Name { operator, value } => {
                match_optional_string(*operator, entity.name(), value)
            }
            Condition::Identifier { operator, value } => {
                match_optional_string(*operator, entity.identifier(), value)
            }
            Condition::Version { operator, value } => {
                match_optional_string(*operator, entity.version(), value)
            }
            Condition::Metadata {
                key,
                operator,
                value,
            } => {
                let actual = entity.metadata_value(key);
                match (operator.as_string_operator(), value) {
                    (None, _) => actual.is_none(),
                    (Some(operator), Some(value)) => {
                        match_optional_string(operator, actual, value)
                    }
                    (Some(_), None) => false,
                }
            }
            Condition::CreatedAt { operator, value } => {
                match_date(*operator, entity.created_at(), value)
            }
            Condition::UpdatedAt { operator, value } => {
                match_date(*operator, entity.updated_at(), value)
            }
            Condition::Comparison {
                operator,
                not,
                conditions,
            } => {
                let result = if conditions.is_empty() {
                    false
                } else {
                    match operator {
                        ComparisonOperator::And => conditions.iter().all(|c| c.matches(entity)),
                        ComparisonOperator::Or => conditions.iter().any(|c| c.matches(entity)),
                    }
                };

                result != *not
            }
        }
    }

    /// Checks the structural rules a condition must satisfy before it is stored.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_at_depth(0)
    }

    fn validate_at_depth(&self, depth: usize) -> anyhow::Result<()> {
        match self {
            Condition::Name { operator, value }
            | Condition::Identifier { operator, value }
            | Condition::Version { operator, value } => {
                if *operator == StringOperator::Regex {
                    Regex::new(value)
                        .map_err(|err| anyhow::anyhow!("invalid regex '{}': {}", value, err))?;
                }
                Ok(())
            }
            Condition::Metadata {
                key,
                operator,
                value,
            } => {
                if key.is_empty() {
                    return Err(anyhow::anyhow!("metadata condition requires a key"));
                }

                match (operator, value) {
                    (MetadataOperator::Null, _) => Ok(()),
                    (_, None) => Err(anyhow::anyhow!(
                        "metadata condition on '{}' requires a value",
                        key
                    )),
                    (MetadataOperator::Regex, Some(value)) => {
                        Regex::new(value).map_err(|err| {
                            anyhow::anyhow!("invalid regex '{}': {}", value, err)
                        })?;
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            Condition::Comparison { conditions, .. } => {
                for condition in conditions {
                    if let Condition::Comparison { .. } = condition {
                        if depth >= MAX_CONDITION_DEPTH {
                            return Err(anyhow::anyhow!(
                                "conditions may nest at most {} comparison levels",
                                MAX_CONDITION_DEPTH
                            ));
                        }
                    }
                    condition.validate_at_depth(depth + 1)?;
                }
                Ok(())
            }
            Condition::Id { .. }
            | Condition::Kind { .. }
            | Condition::CreatedAt { .. }
            | Condition::UpdatedAt { .. } => Ok(()),
        }
    }
}
