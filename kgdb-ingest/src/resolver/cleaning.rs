//! Mention cleaning and rejection

use std::collections::HashSet;

/// Type/source prefixes stripped before anything else (matched case-insensitively)
const TYPE_PREFIXES: &[&str] = &["GENE_SYMBOL:", "GENE:", "PROTEIN:", "LOCUS:", "SYMBOL:"];

/// Prefixes of ontology cross-reference codes (`HP:0000113`, `MONDO:0005301`, ...)
const XREF_PREFIXES: &[&str] = &[
    "HP", "MONDO", "OMIM", "MIM", "ORPHA", "ORPHANET", "DOID", "EFO", "MESH", "UMLS", "NCIT",
];

/// Tokens that look like symbols but are not genes
const DENYLIST: &[&str] = &[
    // disease abbreviations
    "ADPKD", "ARPKD", "CKD", "ESRD", "ESKD", "FSGS", "CAKUT", "AKI", "HUS", "AHUS", "SLE", "IGAN",
    "MCD", "GN", "NS", "SRNS",
    // assays and methods
    "DNA", "RNA", "PCR", "QPCR", "NGS", "WES", "WGS", "MLPA", "CNV", "SNP", "SNV", "FISH", "ELISA",
    "MRI", "CT",
    // placeholders
    "NA", "NONE", "UNKNOWN", "TBD", "NULL", "OTHER",
];

/// Characters that separate list items in a mention
fn is_list_separator(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | ';' | '/' | '|' | '(' | '[')
}

/// Outcome of cleaning one mention
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleaned {
    /// Upper-cased candidate symbol
    Symbol(String),
    Rejected(String),
}

/// Cleaning rules with the configured denylist and minimum length
#[derive(Debug, Clone)]
pub struct MentionCleaner {
    denylist: HashSet<String>,
    min_length: usize,
}

impl MentionCleaner {
    pub fn new(extra_denylist: &[String], min_length: usize) -> Self {
        let denylist = DENYLIST
            .iter()
            .map(|t| t.to_string())
            .chain(extra_denylist.iter().map(|t| t.trim().to_uppercase()))
            .collect();
        Self {
            denylist,
            min_length: min_length.max(1),
        }
    }

    pub fn clean(&self, raw: &str) -> Cleaned {
        let mut text = raw.trim();

        // Prefixes can stack ("GENE:SYMBOL:PKD1")
        loop {
            let upper = text.to_ascii_uppercase();
            match TYPE_PREFIXES.iter().find(|p| upper.starts_with(*p)) {
                Some(prefix) => text = text[prefix.len()..].trim_start(),
                None => break,
            }
        }

        let token = text.split(is_list_separator).find(|t| !t.is_empty()).unwrap_or("");

        if let Some((prefix, rest)) = token.split_once(':') {
            if XREF_PREFIXES.contains(&prefix.to_ascii_uppercase().as_str()) {
                return Cleaned::Rejected(format!("ontology cross-reference '{}:{}'", prefix, rest));
            }
        }

        let symbol: String = token
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-')
            .collect::<String>()
            .trim_matches('-')
            .to_uppercase();

        if symbol.is_empty() {
            return Cleaned::Rejected("no symbol characters".to_string());
        }
        if symbol.chars().count() < self.min_length {
            return Cleaned::Rejected(format!(
                "shorter than {} characters",
                self.min_length
            ));
        }
        if symbol.chars().all(|c| c.is_ascii_digit()) {
            return Cleaned::Rejected("numeric token".to_string());
        }
        if self.denylist.contains(&symbol) {
            return Cleaned::Rejected(format!("denylisted token '{}'", symbol));
        }

        Cleaned::Symbol(symbol)
    }
}

impl Default for MentionCleaner {
    fn default() -> Self {
        Self::new(&[], 2)
    }
}
