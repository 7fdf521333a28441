use std::fmt;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::parse::ParseError;
use crate::util::is_false;

/// Lowercases a flag name and replaces every rune that is neither letter nor
/// digit with `.`. Lossy and idempotent.
pub fn normalize_flag_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else {
            out.push('.');
        }
    }
    out
}

/// Lowercases a service name.
pub fn normalize_service_name(name: &str) -> String {
    name.to_lowercase()
}

/// A feature flag. Identity is the `(service_name, name)` pair after
/// normalization; the remaining fields are replaceable attributes.
///
/// Deserializing a flag with a textual `expr` but no condition tree parses
/// the expression into the tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FlagRepr")]
pub struct Flag {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// The owning service; empty means the flag is global.
    #[serde(rename = "service", skip_serializing_if = "String::is_empty")]
    pub service_name: String,

    #[serde(rename = "raw", skip_serializing_if = "String::is_empty")]
    pub raw_value: String,
    #[serde(skip_serializing_if = "is_false")]
    pub value: bool,

    #[serde(rename = "cond", skip_serializing_if = "Condition::is_empty")]
    pub condition: Condition,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub expr: String,
}

#[derive(Deserialize)]
struct FlagRepr {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "service")]
    service_name: String,
    #[serde(default, rename = "raw")]
    raw_value: String,
    #[serde(default)]
    value: bool,
    #[serde(default, rename = "cond")]
    condition: Condition,
    #[serde(default)]
    expr: String,
}

impl TryFrom<FlagRepr> for Flag {
    type Error = ParseError;

    fn try_from(repr: FlagRepr) -> Result<Self, Self::Error> {
        let condition = if !repr.expr.is_empty() && repr.condition.is_empty() {
            repr.expr.parse()?
        } else {
            repr.condition
        };

        Ok(Flag {
            name: repr.name,
            service_name: repr.service_name,
            raw_value: repr.raw_value,
            value: repr.value,
            condition,
            expr: repr.expr,
        })
    }
}

impl Flag {
    /// Returns a copy with normalized `name` and `service_name`.
    pub fn normalized(&self) -> Flag {
        Flag {
            name: normalize_flag_name(&self.name),
            service_name: normalize_service_name(&self.service_name),
            ..self.clone()
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.service_name.is_empty() {
            write!(f, "[{}]", self.service_name)?;
        }
        write!(f, "={}", self.raw_value)?;
        if !self.condition.is_empty() {
            write!(f, " {}", self.condition)?;
        }
        Ok(())
    }
}
