//! In-process nomenclature authority

use async_trait::async_trait;
use kgdb_common::{Error, Result};
use kgdb_ingest::resolver::{NomenclatureAuthority, NomenclatureRecord};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Answers from a fixed table, matching symbols and aliases
#[derive(Default)]
pub struct StaticAuthority {
    records: Vec<NomenclatureRecord>,
    calls: AtomicUsize,
    /// Symbols whose next lookup fails
    failing: Mutex<HashSet<String>>,
}

impl StaticAuthority {
    /// `(symbol, hgnc_id, aliases)` entries
    pub fn new(entries: &[(&str, &str, &[&str])]) -> Self {
        Self {
            records: entries
                .iter()
                .map(|(symbol, hgnc_id, aliases)| NomenclatureRecord {
                    hgnc_id: hgnc_id.to_string(),
                    symbol: symbol.to_string(),
                    aliases: aliases.iter().map(|a| a.to_string()).collect(),
                })
                .collect(),
            calls: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Fail the next lookup that includes `symbol`
    pub fn fail_once(&self, symbol: &str) {
        self.failing.lock().unwrap().insert(symbol.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NomenclatureAuthority for StaticAuthority {
    async fn lookup_batch(
        &self,
        symbols: &[String],
        _cancel: &CancellationToken,
    ) -> Result<HashMap<String, NomenclatureRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failing = self.failing.lock().unwrap();
            if let Some(symbol) = symbols.iter().find(|s| failing.contains(*s)) {
                let symbol = symbol.clone();
                failing.remove(&symbol);
                return Err(Error::upstream(format!("authority unavailable for {}", symbol)));
            }
        }
        let mut found = HashMap::new();
        for symbol in symbols {
            let exact = self.records.iter().find(|r| r.symbol == *symbol);
            let by_alias: Vec<&NomenclatureRecord> = self
                .records
                .iter()
                .filter(|r| r.aliases.iter().any(|a| a == symbol))
                .collect();
            let record = match (exact, by_alias.as_slice()) {
                (Some(record), _) => record,
                (None, [only]) => *only,
                _ => continue,
            };
            found.insert(symbol.clone(), record.clone());
        }
        Ok(found)
    }
}
