use serde::{Deserialize, Serialize};

use crate::{resolve_limit, VaultError, DEFAULT_QUERY_LIMIT};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterColumn {
    Ache,
    Drift,
    Entropy,
    T,
}

impl FilterColumn {
    /// Column name in the `memory_cycles` table.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ache => "ache",
            Self::Drift => "drift",
            Self::Entropy => "entropy",
            Self::T => "t",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Min,
    Max,
}

impl Bound {
    #[must_use]
    pub fn operator(self) -> &'static str {
        match self {
            Self::Min => ">=",
            Self::Max => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FilterValue {
    Integer(i64),
    Float(f64),
}

/// One inclusive bound on one column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RangePredicate {
    pub column: FilterColumn,
    pub bound: Bound,
    pub value: FilterValue,
}

/// Optional inclusive bounds per metric and on `t`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CycleFilter {
    #[serde(default)]
    pub ache_min: Option<f64>,
    #[serde(default)]
    pub ache_max: Option<f64>,
    #[serde(default)]
    pub drift_min: Option<f64>,
    #[serde(default)]
    pub drift_max: Option<f64>,
    #[serde(default)]
    pub entropy_min: Option<f64>,
    #[serde(default)]
    pub entropy_max: Option<f64>,
    #[serde(default)]
    pub t_min: Option<i64>,
    #[serde(default)]
    pub t_max: Option<i64>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl CycleFilter {
    /// Translate the supplied bounds into predicates, in a fixed column order.
    /// Absent bounds contribute nothing.
    #[must_use]
    pub fn predicates(&self) -> Vec<RangePredicate> {
        let float_bounds = [
            (FilterColumn::Ache, Bound::Min, self.ache_min),
            (FilterColumn::Ache, Bound::Max, self.ache_max),
            (FilterColumn::Drift, Bound::Min, self.drift_min),
            (FilterColumn::Drift, Bound::Max, self.drift_max),
            (FilterColumn::Entropy, Bound::Min, self.entropy_min),
            (FilterColumn::Entropy, Bound::Max, self.entropy_max),
        ];
        let integer_bounds =
            [(FilterColumn::T, Bound::Min, self.t_min), (FilterColumn::T, Bound::Max, self.t_max)];

        let floats = float_bounds.into_iter().filter_map(|(column, bound, value)| {
            value.map(|value| RangePredicate { column, bound, value: FilterValue::Float(value) })
        });
        let integers = integer_bounds.into_iter().filter_map(|(column, bound, value)| {
            value.map(|value| RangePredicate { column, bound, value: FilterValue::Integer(value) })
        });

        floats.chain(integers).collect()
    }

    /// Check bounds and resolve the effective row limit.
    ///
    /// # Errors
    /// Returns [`VaultError::Validation`] when a metric bound is not finite or the limit
    /// is out of range.
    pub fn validate(&self) -> Result<u32, VaultError> {
        for predicate in self.predicates() {
            if let FilterValue::Float(value) = predicate.value {
                if !value.is_finite() {
                    return Err(VaultError::Validation(format!(
                        "{} bound MUST be a finite number",
                        predicate.column.as_str()
                    )));
                }
            }
        }
        resolve_limit(self.limit, DEFAULT_QUERY_LIMIT)
    }
}
