use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the condition value every client provides implicitly, so flag
/// authors can discriminate on the consuming service without the caller
/// passing it per lookup.
pub const SERVICE_NAME_VALUE: &str = "serviceName";

/// The declared type of a [ConditionValue], encoded on the wire as 0..=3.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ValueType {
    #[default]
    Int,
    Float,
    Bool,
    String,
}

impl From<ValueType> for u8 {
    fn from(t: ValueType) -> u8 {
        match t {
            ValueType::Int => 0,
            ValueType::Float => 1,
            ValueType::Bool => 2,
            ValueType::String => 3,
        }
    }
}

impl TryFrom<u8> for ValueType {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(ValueType::Int),
            1 => Ok(ValueType::Float),
            2 => Ok(ValueType::Bool),
            3 => Ok(ValueType::String),
            other => Err(format!("invalid value type {other}")),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::String => "string",
        })
    }
}

/// Conjunction operator of a [Condition] node, encoded as 0 (AND) or 1 (OR).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ConditionOp {
    #[default]
    And,
    Or,
}

impl ConditionOp {
    pub(crate) fn is_and(&self) -> bool {
        *self == ConditionOp::And
    }
}

impl From<ConditionOp> for u8 {
    fn from(op: ConditionOp) -> u8 {
        match op {
            ConditionOp::And => 0,
            ConditionOp::Or => 1,
        }
    }
}

impl TryFrom<u8> for ConditionOp {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(ConditionOp::And),
            1 => Ok(ConditionOp::Or),
            other => Err(format!("invalid condition operator {other}")),
        }
    }
}

impl fmt::Display for ConditionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConditionOp::And => "&&",
            ConditionOp::Or => "||",
        })
    }
}

/// Comparison operator of a [ConditionField], encoded as 0..=3.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FieldOp {
    #[default]
    Eq,
    Ne,
    Lt,
    Gt,
}

impl FieldOp {
    pub(crate) fn is_eq(&self) -> bool {
        *self == FieldOp::Eq
    }
}

impl From<FieldOp> for u8 {
    fn from(op: FieldOp) -> u8 {
        match op {
            FieldOp::Eq => 0,
            FieldOp::Ne => 1,
            FieldOp::Lt => 2,
            FieldOp::Gt => 3,
        }
    }
}

impl TryFrom<u8> for FieldOp {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(FieldOp::Eq),
            1 => Ok(FieldOp::Ne),
            2 => Ok(FieldOp::Lt),
            3 => Ok(FieldOp::Gt),
            other => Err(format!("invalid field operator {other}")),
        }
    }
}

impl fmt::Display for FieldOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldOp::Eq => "==",
            FieldOp::Ne => "!=",
            FieldOp::Lt => "<",
            FieldOp::Gt => ">",
        })
    }
}

/// A typed literal carried by condition values and fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Bool(_) => ValueType::Bool,
            Value::String(_) => ValueType::String,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

impl fmt::Display for Value {
    /// Renders the literal in the form the expression lexer reads back.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::String(s) => {
                // Prefer single quotes; switch to double quotes when that
                // avoids escaping altogether.
                let quote = if s.contains('\'') && !s.contains('"') {
                    '"'
                } else {
                    '\''
                };
                write!(f, "{quote}")?;
                for ch in s.chars() {
                    if ch == quote {
                        write!(f, "\\")?;
                    }
                    write!(f, "{ch}")?;
                }
                write!(f, "{quote}")
            }
        }
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("invalid {expected} value of type {found}")]
    TypeMismatch { expected: ValueType, found: ValueType },
}

/// A named, typed value: the unit both sides of a field comparison are made
/// of. The declared [ValueType] and the concrete [Value] may disagree on
/// hand-built or freshly decoded data; [ConditionValue::validate] rejects
/// that.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConditionValue {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub value: Value,
}

impl ConditionValue {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        ConditionValue {
            name: name.into(),
            value_type: value.value_type(),
            value,
        }
    }

    pub fn validate(&self) -> Result<(), ConditionError> {
        let found = self.value.value_type();
        if found == self.value_type {
            Ok(())
        } else {
            Err(ConditionError::TypeMismatch {
                expected: self.value_type,
                found,
            })
        }
    }
}

#[derive(Deserialize)]
struct ConditionValueRepr {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    value_type: ValueType,
    value: Value,
}

impl<'de> Deserialize<'de> for ConditionValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let repr = ConditionValueRepr::deserialize(deserializer)?;

        // JSON has a single number type; coerce the concrete value to the
        // declared numeric type after decoding.
        let value = match (repr.value_type, repr.value) {
            (ValueType::Int, Value::Float(f)) => Value::Int(f as i64),
            (ValueType::Float, Value::Int(i)) => Value::Float(i as f64),
            (_, value) => value,
        };

        Ok(ConditionValue {
            name: repr.name,
            value_type: repr.value_type,
            value,
        })
    }
}

/// A single comparison of a named value against a stored literal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionField {
    #[serde(flatten)]
    pub value: ConditionValue,
    #[serde(default, skip_serializing_if = "FieldOp::is_eq")]
    pub op: FieldOp,
}

impl ConditionField {
    pub fn new(name: impl Into<String>, op: FieldOp, value: impl Into<Value>) -> Self {
        ConditionField {
            value: ConditionValue::new(name, value),
            op,
        }
    }

    /// The first value matching this field's `(name, type)` pair decides the
    /// outcome; the rest are not consulted. Ordering comparisons put the
    /// stored literal on the left: `userID < 10` matches a provided
    /// `userID = 20` because `10 < 20`.
    fn matches(&self, values: &[ConditionValue]) -> bool {
        for v in values {
            if v.name != self.value.name || v.value_type != self.value.value_type {
                continue;
            }

            return match self.op {
                FieldOp::Eq => self.value.value == v.value,
                FieldOp::Ne => self.value.value != v.value,
                FieldOp::Lt => self.ordered(&v.value, Ordering::Less),
                FieldOp::Gt => self.ordered(&v.value, Ordering::Greater),
            };
        }

        false
    }

    fn ordered(&self, other: &Value, expect: Ordering) -> bool {
        match (&self.value.value, other) {
            (Value::Int(l), Value::Int(r)) => l.cmp(r) == expect,
            (Value::Float(l), Value::Float(r)) => l.partial_cmp(r) == Some(expect),
            (Value::String(l), Value::String(r)) => l.cmp(r) == expect,
            // Booleans have no order.
            _ => false,
        }
    }
}

impl fmt::Display for ConditionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.value.name, self.op, self.value.value)
    }
}

/// A boolean predicate tree over named typed values.
///
/// A node combines its sub-conditions and fields with a single conjunction
/// operator; an empty node matches everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "ConditionOp::is_and")]
    pub op: ConditionOp,
    #[serde(default, rename = "conds", skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<ConditionField>,
}

impl Condition {
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.fields.is_empty()
    }

    /// Checks that every field in the tree carries a value of its declared
    /// type.
    pub fn validate(&self) -> Result<(), ConditionError> {
        for c in &self.conditions {
            c.validate()?;
        }
        for f in &self.fields {
            f.value.validate()?;
        }
        Ok(())
    }

    /// Evaluates the predicate against the given values.
    ///
    /// An empty node matches any input; a non-empty node never matches an
    /// empty value list. AND stops at the first failing matcher; OR runs
    /// every matcher and folds the results.
    pub fn matches(&self, values: &[ConditionValue]) -> bool {
        if self.is_empty() {
            return true;
        }
        if values.is_empty() {
            return false;
        }

        match self.op {
            ConditionOp::And => {
                self.conditions.iter().all(|c| c.matches(values))
                    && self.fields.iter().all(|f| f.matches(values))
            }
            ConditionOp::Or => {
                let mut matched = false;
                for c in &self.conditions {
                    matched |= c.matches(values);
                }
                for f in &self.fields {
                    matched |= f.matches(values);
                }
                matched
            }
        }
    }
}

impl fmt::Display for Condition {
    /// Renders the tree as an expression the parser reads back.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;

        let mut first = true;
        for c in &self.conditions {
            if !first {
                write!(f, " {} ", self.op)?;
            }
            first = false;
            write!(f, "{c}")?;
        }
        for field in &self.fields {
            if !first {
                write!(f, " {} ", self.op)?;
            }
            first = false;
            write!(f, "{field}")?;
        }

        f.write_str(")")
    }
}
