//! Gene identifier harmonization between a reference atlas and the query.
//!
//! The reference names genes by accession, the query by symbol. A symbol that
//! maps to more than one distinct accession cannot be matched safely and is
//! excluded from the mapping.

use anyhow::Error;
use fxhash::FxHashSet;
use log::{info, warn};
use scflow_types::{FeatureBarcodeMatrix, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// What to do with a symbol that maps to several accessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbiguityPolicy {
    /// leave the symbol out of the mapping
    #[default]
    Drop,
    /// abort with `AmbiguousIdentifier`
    Fail,
}

impl FromStr for AmbiguityPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(AmbiguityPolicy::Drop),
            "fail" => Ok(AmbiguityPolicy::Fail),
            _ => Err(PipelineError::UnknownMethod {
                kind: "ambiguity policy",
                name: s.to_string(),
            }),
        }
    }
}

/// Symbol -> accession, one accession per symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneMapping {
    pub symbol_to_accession: BTreeMap<String, String>,
    /// symbols excluded because they map to several accessions
    pub ambiguous: Vec<String>,
}

impl GeneMapping {
    /// Build from parallel accession and symbol lists.
    pub fn build(accessions: &[String], symbols: &[String], policy: AmbiguityPolicy) -> Result<GeneMapping, Error> {
        if accessions.len() != symbols.len() {
            return Err(PipelineError::dims("gene accessions vs symbols", accessions.len(), symbols.len()).into());
        }
        let mut by_symbol: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (acc, sym) in accessions.iter().zip(symbols) {
            by_symbol.entry(sym.as_str()).or_default().insert(acc.as_str());
        }

        let mut mapping = GeneMapping::default();
        for (symbol, accs) in by_symbol {
            if accs.len() > 1 {
                if policy == AmbiguityPolicy::Fail {
                    return Err(PipelineError::AmbiguousIdentifier {
                        symbol: symbol.to_string(),
                        accessions: accs.iter().map(|a| a.to_string()).collect(),
                    }
                    .into());
                }
                mapping.ambiguous.push(symbol.to_string());
            } else if let Some(acc) = accs.into_iter().next() {
                mapping.symbol_to_accession.insert(symbol.to_string(), acc.to_string());
            }
        }
        if !mapping.ambiguous.is_empty() {
            warn!(
                "dropping {} ambiguous gene symbols (e.g. {})",
                mapping.ambiguous.len(),
                mapping.ambiguous[0]
            );
        }
        Ok(mapping)
    }

    /// Keep only symbols present in `query_symbols`.
    pub fn restrict_to(&self, query_symbols: &[String]) -> GeneMapping {
        let query: FxHashSet<&str> = query_symbols.iter().map(String::as_str).collect();
        GeneMapping {
            symbol_to_accession: self
                .symbol_to_accession
                .iter()
                .filter(|(s, _)| query.contains(s.as_str()))
                .map(|(s, a)| (s.clone(), a.clone()))
                .collect(),
            ambiguous: self.ambiguous.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.symbol_to_accession.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbol_to_accession.is_empty()
    }
}

/// Reduce `reference` to the genes of the harmonized mapping, with rows named
/// by symbol. Returns the reduced matrix and the mapping.
pub fn harmonize_reference(
    reference: &FeatureBarcodeMatrix,
    query_symbols: &[String],
    policy: AmbiguityPolicy,
) -> Result<(FeatureBarcodeMatrix, GeneMapping), Error> {
    let mapping = GeneMapping::build(&reference.feature_ids, &reference.feature_names, policy)?.restrict_to(query_symbols);
    if mapping.is_empty() {
        return Err(PipelineError::EmptyInput("genes shared by reference and query".to_string()).into());
    }

    let mut seen = FxHashSet::default();
    let rows = reference
        .feature_names
        .iter()
        .enumerate()
        .filter(|(_, sym)| mapping.symbol_to_accession.contains_key(sym.as_str()) && seen.insert(sym.as_str()))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    info!(
        "reference harmonized: {} of {} genes shared with the query",
        rows.len(),
        reference.num_features()
    );
    Ok((reference.select_features(&rows), mapping))
}
