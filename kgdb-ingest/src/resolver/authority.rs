//! External nomenclature authority
//!
//! The resolver asks the authority about every symbol it cannot match
//! locally, one batched query per chunk of symbols.

use async_trait::async_trait;
use kgdb_common::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::fetch::FetchClient;

/// Canonical identity as reported by the authority
#[derive(Debug, Clone, PartialEq)]
pub struct NomenclatureRecord {
    pub hgnc_id: String,
    pub symbol: String,
    /// Alias and previous symbols
    pub aliases: Vec<String>,
}

#[async_trait]
pub trait NomenclatureAuthority: Send + Sync {
    /// Look up `symbols` (upper-cased) in one request.
    ///
    /// Only confident matches are returned, keyed by the queried symbol.
    /// Symbols without a confident match are simply absent.
    async fn lookup_batch(
        &self,
        symbols: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, NomenclatureRecord>>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    response: SearchDocs,
}

#[derive(Debug, Deserialize)]
struct SearchDocs {
    #[serde(default)]
    docs: Vec<SearchDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchDoc {
    hgnc_id: String,
    symbol: String,
    #[serde(default)]
    alias_symbol: Vec<String>,
    #[serde(default)]
    prev_symbol: Vec<String>,
    score: Option<f64>,
}

impl SearchDoc {
    fn into_record(self) -> NomenclatureRecord {
        let mut aliases: Vec<String> = self
            .alias_symbol
            .into_iter()
            .chain(self.prev_symbol)
            .map(|a| a.trim().to_uppercase())
            .filter(|a| !a.is_empty())
            .collect();
        aliases.sort();
        aliases.dedup();
        NomenclatureRecord {
            hgnc_id: self.hgnc_id,
            symbol: self.symbol.trim().to_string(),
            aliases,
        }
    }

    fn matches_alias(&self, symbol: &str) -> bool {
        self.alias_symbol
            .iter()
            .chain(self.prev_symbol.iter())
            .any(|a| a.eq_ignore_ascii_case(symbol))
    }
}

/// HGNC-style search client: `GET {url}?query=symbol:"A" OR alias_symbol:"A" OR ...`
pub struct HgncClient {
    fetch: FetchClient,
    url: String,
    min_score: f64,
}

impl HgncClient {
    pub fn new(fetch: FetchClient, url: impl Into<String>, min_score: f64) -> Self {
        Self {
            fetch,
            url: url.into(),
            min_score,
        }
    }

    fn build_query(symbols: &[String]) -> String {
        symbols
            .iter()
            .map(|s| {
                format!(
                    "symbol:\"{s}\" OR alias_symbol:\"{s}\" OR prev_symbol:\"{s}\"",
                    s = s
                )
            })
            .collect::<Vec<_>>()
            .join(" OR ")
    }

    /// Pick a confident record for each queried symbol.
    ///
    /// An approved-symbol hit wins outright; otherwise exactly one document
    /// must list the symbol as an alias or previous symbol.
    fn select_matches(&self, symbols: &[String], docs: Vec<SearchDoc>) -> HashMap<String, NomenclatureRecord> {
        let docs: Vec<SearchDoc> = docs
            .into_iter()
            .filter(|d| d.score.map_or(true, |score| score >= self.min_score))
            .collect();

        let mut matches = HashMap::new();
        for symbol in symbols {
            let exact: Vec<&SearchDoc> = docs
                .iter()
                .filter(|d| d.symbol.eq_ignore_ascii_case(symbol))
                .collect();

            let chosen = if exact.len() == 1 {
                Some(exact[0])
            } else if exact.is_empty() {
                let by_alias: Vec<&SearchDoc> =
                    docs.iter().filter(|d| d.matches_alias(symbol)).collect();
                if by_alias.len() == 1 {
                    Some(by_alias[0])
                } else {
                    if by_alias.len() > 1 {
                        tracing::debug!(symbol = %symbol, candidates = by_alias.len(), "Ambiguous alias at authority");
                    }
                    None
                }
            } else {
                None
            };

            if let Some(doc) = chosen {
                matches.insert(symbol.clone(), doc.clone().into_record());
            }
        }
        matches
    }
}

#[async_trait]
impl NomenclatureAuthority for HgncClient {
    async fn lookup_batch(
        &self,
        symbols: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, NomenclatureRecord>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let params = vec![("query".to_string(), Self::build_query(symbols))];
        let payload = self
            .fetch
            .request_with_cancel(&self.url, &params, cancel)
            .await?;

        let response: SearchResponse = serde_json::from_value(payload).map_err(|e| {
            Error::upstream(format!("Malformed nomenclature response: {}", e))
        })?;

        let matches = self.select_matches(symbols, response.response.docs);
        tracing::debug!(
            queried = symbols.len(),
            matched = matches.len(),
            "Nomenclature batch lookup"
        );
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::RetryPolicy;
    use crate::fetch::RateLimiterRegistry;
    use std::time::Duration;

    fn client(min_score: f64) -> HgncClient {
        let limiter = RateLimiterRegistry::new().limiter_for("hgnc", 100.0).unwrap();
        let fetch = FetchClient::new(
            "hgnc",
            reqwest::Client::new(),
            limiter,
            RetryPolicy::default(),
            CacheStore::in_memory(8),
            Duration::ZERO,
        );
        HgncClient::new(fetch, "http://127.0.0.1:9/search", min_score)
    }

    fn doc(hgnc_id: &str, symbol: &str, aliases: &[&str], score: f64) -> SearchDoc {
        SearchDoc {
            hgnc_id: hgnc_id.to_string(),
            symbol: symbol.to_string(),
            alias_symbol: aliases.iter().map(|a| a.to_string()).collect(),
            prev_symbol: Vec::new(),
            score: Some(score),
        }
    }

    #[test]
    fn test_exact_symbol_beats_alias() {
        let matches = client(0.0).select_matches(
            &["PKD1".to_string()],
            vec![
                doc("HGNC:9008", "PKD1", &["PBP"], 10.0),
                doc("HGNC:1", "OTHER", &["PKD1"], 5.0),
            ],
        );
        assert_eq!(matches["PKD1"].hgnc_id, "HGNC:9008");
        assert_eq!(matches["PKD1"].aliases, vec!["PBP"]);
    }

    #[test]
    fn test_ambiguous_alias_is_not_confident() {
        let matches = client(0.0).select_matches(
            &["SHARED".to_string(), "UNIQ".to_string()],
            vec![
                doc("HGNC:1", "AAA1", &["SHARED"], 5.0),
                doc("HGNC:2", "BBB2", &["SHARED", "UNIQ"], 5.0),
            ],
        );
        assert!(!matches.contains_key("SHARED"));
        assert_eq!(matches["UNIQ"].symbol, "BBB2");
    }

    #[test]
    fn test_canonical_symbol_case_is_kept() {
        let matches = client(0.0).select_matches(
            &["C3ORF52".to_string()],
            vec![doc("HGNC:26255", "C3orf52", &["TTMP"], 10.0)],
        );
        assert_eq!(matches["C3ORF52"].symbol, "C3orf52");
        assert_eq!(matches["C3ORF52"].aliases, vec!["TTMP"]);
    }

    #[test]
    fn test_low_score_filtered() {
        let matches = client(3.0).select_matches(
            &["PKD2".to_string()],
            vec![doc("HGNC:9009", "PKD2", &[], 1.0)],
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn test_query_covers_all_name_fields() {
        let query = HgncClient::build_query(&["PKD1".to_string(), "UMOD".to_string()]);
        assert!(query.contains("symbol:\"PKD1\""));
        assert!(query.contains("prev_symbol:\"UMOD\""));
        assert_eq!(query.matches(" OR ").count(), 5);
    }
}
