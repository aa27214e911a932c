//! Record trait and index/filter types

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current wall clock time in Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A value stored in the index table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    /// Encoded form written to the `value` column
    pub(crate) fn encode(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

/// Comparison operator for a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
}

/// Filter on an indexed field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    /// Equality filter shorthand
    pub fn eq(field: impl Into<String>, value: IndexValue) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value,
        }
    }

    pub(crate) fn matches(&self, fields: &HashMap<String, String>) -> bool {
        let actual = fields.get(&self.field);
        let expected = self.value.encode();
        match self.op {
            FilterOp::Eq => actual == Some(&expected),
            FilterOp::Ne => actual != Some(&expected),
        }
    }
}

/// A type that can be persisted in a [`crate::Store`]
pub trait Record: Serialize + DeserializeOwned {
    /// Unique identifier within the collection
    fn id(&self) -> &str;

    /// Last update timestamp (Unix milliseconds)
    fn updated_at(&self) -> i64;

    /// Collection (table namespace) this record lives in
    fn collection_name() -> &'static str;

    /// Fields to index for filtering
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}
