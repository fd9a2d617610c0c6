//! Index utilization decoding and rendering
//!
//! The gateway reports index usage in the `x-ms-cosmos-index-utilization`
//! header: a base64-encoded JSON document listing the single and composite
//! indexes a query used or could have used. Decoding is best effort. A
//! missing or malformed payload yields [`IndexUtilizationInfo::empty`] so
//! diagnostics can never fail the query that carried them.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Usage of a single-path index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SingleIndexUtilizationEntity {
    pub filter_expression: String,
    #[serde(alias = "IndexDocumentExpression")]
    pub index_spec: String,
    pub filter_precise_set: bool,
    pub index_precise_set: bool,
    pub index_impact_score: String,
}

/// Usage of a composite index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CompositeIndexUtilizationEntity {
    #[serde(alias = "IndexDocumentExpressions")]
    pub index_specs: Vec<String>,
    pub index_precise_set: bool,
    pub index_impact_score: String,
}

/// Structured index usage report for one query response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IndexUtilizationInfo {
    utilized_single_indexes: Vec<SingleIndexUtilizationEntity>,
    potential_single_indexes: Vec<SingleIndexUtilizationEntity>,
    utilized_composite_indexes: Vec<CompositeIndexUtilizationEntity>,
    potential_composite_indexes: Vec<CompositeIndexUtilizationEntity>,
}

impl IndexUtilizationInfo {
    pub fn new(
        utilized_single_indexes: Vec<SingleIndexUtilizationEntity>,
        potential_single_indexes: Vec<SingleIndexUtilizationEntity>,
        utilized_composite_indexes: Vec<CompositeIndexUtilizationEntity>,
        potential_composite_indexes: Vec<CompositeIndexUtilizationEntity>,
    ) -> Self {
        Self {
            utilized_single_indexes,
            potential_single_indexes,
            utilized_composite_indexes,
            potential_composite_indexes,
        }
    }

    /// The canonical empty report
    pub fn empty() -> Self {
        Self::default()
    }

    /// Decode a header payload
    ///
    /// `is_encoded` selects the base64 stage. Never fails: absent or
    /// malformed input returns [`IndexUtilizationInfo::empty`].
    pub fn decode(payload: Option<&str>, is_encoded: bool) -> Self {
        let Some(payload) = payload else {
            return Self::empty();
        };

        match Self::try_decode(payload, is_encoded) {
            Ok(info) => info,
            Err(reason) => {
                tracing::debug!(%reason, "Discarding undecodable index utilization payload");
                Self::empty()
            }
        }
    }

    fn try_decode(payload: &str, is_encoded: bool) -> Result<Self, String> {
        let json = if is_encoded {
            let bytes = STANDARD
                .decode(payload.trim())
                .map_err(|e| format!("base64: {}", e))?;
            String::from_utf8(bytes).map_err(|e| format!("utf-8: {}", e))?
        } else {
            payload.to_string()
        };

        let info: Option<Self> =
            serde_json::from_str(&json).map_err(|e| format!("json: {}", e))?;
        Ok(info.unwrap_or_default())
    }

    pub fn utilized_single_indexes(&self) -> &[SingleIndexUtilizationEntity] {
        &self.utilized_single_indexes
    }

    pub fn potential_single_indexes(&self) -> &[SingleIndexUtilizationEntity] {
        &self.potential_single_indexes
    }

    pub fn utilized_composite_indexes(&self) -> &[CompositeIndexUtilizationEntity] {
        &self.utilized_composite_indexes
    }

    pub fn potential_composite_indexes(&self) -> &[CompositeIndexUtilizationEntity] {
        &self.potential_composite_indexes
    }

    pub fn is_empty(&self) -> bool {
        self.utilized_single_indexes.is_empty()
            && self.potential_single_indexes.is_empty()
            && self.utilized_composite_indexes.is_empty()
            && self.potential_composite_indexes.is_empty()
    }
}

/// Renders an [`IndexUtilizationInfo`] as indented text
pub struct IndexMetricsWriter;

impl IndexMetricsWriter {
    const INDENT: &'static str = "  ";

    pub fn write(info: &IndexUtilizationInfo) -> String {
        let mut out = String::new();
        Self::line(&mut out, 0, "Index Utilization Information");

        Self::line(&mut out, 1, "Utilized Single Indexes");
        for index in info.utilized_single_indexes() {
            Self::write_single(&mut out, index);
        }
        Self::line(&mut out, 1, "Potential Single Indexes");
        for index in info.potential_single_indexes() {
            Self::write_single(&mut out, index);
        }
        Self::line(&mut out, 1, "Utilized Composite Indexes");
        for index in info.utilized_composite_indexes() {
            Self::write_composite(&mut out, index);
        }
        Self::line(&mut out, 1, "Potential Composite Indexes");
        for index in info.potential_composite_indexes() {
            Self::write_composite(&mut out, index);
        }
        out
    }

    fn write_single(out: &mut String, index: &SingleIndexUtilizationEntity) {
        Self::line(out, 2, &format!("Index Spec: {}", index.index_spec));
        Self::line(out, 2, &format!("Index Impact Score: {}", index.index_impact_score));
        Self::line(out, 2, "---");
    }

    fn write_composite(out: &mut String, index: &CompositeIndexUtilizationEntity) {
        Self::line(out, 2, "Index Spec:");
        for spec in &index.index_specs {
            Self::line(out, 3, spec);
        }
        Self::line(out, 2, &format!("Index Impact Score: {}", index.index_impact_score));
        Self::line(out, 2, "---");
    }

    fn line(out: &mut String, depth: usize, text: &str) {
        // Writing to a String cannot fail
        let _ = writeln!(out, "{}{}", Self::INDENT.repeat(depth), text);
    }
}
