// Copyright (c) Facebook, Inc. and its affiliates.
use enum_iterator::IntoEnumIterator;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Application-level performance metrics a sensor can observe and an SLO
/// can constrain.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    IntoEnumIterator,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum AppPerfCategory {
    ResponseTime,
    Throughput,
}

impl AppPerfCategory {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResponseTime => "response-time",
            Self::Throughput => "throughput",
        }
    }

    /// Whether smaller values are better, e.g. latency.
    pub fn lower_is_better(&self) -> bool {
        match self {
            Self::ResponseTime => true,
            Self::Throughput => false,
        }
    }
}

impl fmt::Display for AppPerfCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::AppPerfCategory;
    use enum_iterator::IntoEnumIterator;

    #[test]
    fn test_names_match_serde() {
        for cat in AppPerfCategory::into_enum_iter() {
            let ser = serde_json::to_string(&cat).unwrap();
            println!("{:?} -> {}", cat, &ser);
            assert_eq!(ser, format!("\"{}\"", cat.name()));
        }
    }
}
