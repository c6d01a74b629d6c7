//! Record linkage between adviser fund filings and offering filings.
//!
//! Matching runs as a cascade over lookup indexes built from the offering
//! side: file number, then normalized name, then (when enabled) edit-distance
//! similarity. The first strategy that hits wins.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;
use xref_core::{FundFiling, MatchMethod, OfferingFiling};

pub const CRATE_NAME: &str = "xref-match";

/// Normalized names shorter than this never take part in name matching.
pub const MIN_NAME_LEN: usize = 3;

pub const PE_VC_MISMATCH: &str = "Fund type mismatch: PE vs VC";
pub const HEDGE_MISMATCH: &str = "Hedge fund classification mismatch";

const PUNCTUATION: [char; 8] = [',', '.', '\'', '"', '(', ')', '-', '/'];

const LEGAL_SUFFIXES: [&str; 11] = [
    "LLC",
    "LP",
    "L P",
    "L L C",
    "INC",
    "LTD",
    "CO",
    "CORP",
    "CORPORATION",
    "COMPANY",
    "LIMITED",
];

/// Canonical comparison key for an entity name.
///
/// Uppercases, turns punctuation into spaces (so `L.P.` becomes `L P`),
/// collapses whitespace, then strips trailing legal suffix words until none
/// is left. Names differing only by legal form share a key.
pub fn normalize_name(name: &str) -> String {
    let spaced: String = name
        .to_uppercase()
        .chars()
        .map(|c| if PUNCTUATION.contains(&c) { ' ' } else { c })
        .collect();
    let mut normalized = spaced.split_whitespace().collect::<Vec<_>>().join(" ");

    'strip: loop {
        for suffix in LEGAL_SUFFIXES {
            if let Some(stem) = normalized.strip_suffix(suffix) {
                if stem.ends_with(' ') {
                    normalized = stem.trim_end().to_string();
                    continue 'strip;
                }
            }
        }
        break;
    }

    normalized
}

/// Length-normalized Levenshtein similarity in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let distance = strsim::levenshtein(a, b);
    (max_len - distance) as f64 / max_len as f64
}

/// Lookup structures over offering filings. Both maps are last-write-wins:
/// a filing later in the input replaces an earlier one with the same key.
#[derive(Debug, Default)]
pub struct OfferingIndex<'a> {
    by_key: HashMap<&'a str, &'a OfferingFiling>,
    by_name: BTreeMap<String, &'a OfferingFiling>,
    key_collisions: usize,
    name_collisions: usize,
}

impl<'a> OfferingIndex<'a> {
    pub fn build(filings: impl IntoIterator<Item = &'a OfferingFiling>) -> Self {
        let mut index = Self::default();
        for filing in filings {
            if let Some(key) = filing.file_number.as_deref().map(str::trim) {
                if !key.is_empty() && index.by_key.insert(key, filing).is_some() {
                    index.key_collisions += 1;
                }
            }

            let normalized = normalize_name(filing.entity_name.as_deref().unwrap_or_default());
            if !normalized.is_empty() && index.by_name.insert(normalized, filing).is_some() {
                index.name_collisions += 1;
            }
        }

        debug!(
            keys = index.by_key.len(),
            names = index.by_name.len(),
            key_collisions = index.key_collisions,
            name_collisions = index.name_collisions,
            "offering index built"
        );
        index
    }

    /// Exact file-number lookup; only surrounding whitespace is ignored.
    pub fn by_key(&self, key: &str) -> Option<&'a OfferingFiling> {
        self.by_key.get(key.trim()).copied()
    }

    pub fn by_name(&self, normalized: &str) -> Option<&'a OfferingFiling> {
        self.by_name.get(normalized).copied()
    }

    /// Normalized names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = (&str, &'a OfferingFiling)> + '_ {
        self.by_name.iter().map(|(name, filing)| (name.as_str(), *filing))
    }

    pub fn key_count(&self) -> usize {
        self.by_key.len()
    }

    pub fn name_count(&self) -> usize {
        self.by_name.len()
    }

    pub fn key_collisions(&self) -> usize {
        self.key_collisions
    }

    pub fn name_collisions(&self) -> usize {
        self.name_collisions
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityConfig {
    pub threshold: f64,
    /// Leading characters of the normalized name a candidate must contain.
    pub probe_len: usize,
    pub max_candidates: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            probe_len: 10,
            max_candidates: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match<'a> {
    pub filing: &'a OfferingFiling,
    pub method: MatchMethod,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution<'a> {
    Matched(Match<'a>),
    /// Had a usable key or name but nothing matched.
    Unmatched,
    /// No key and no name long enough to look up.
    Unusable,
}

pub struct MatchCascade<'a> {
    index: &'a OfferingIndex<'a>,
    similarity: Option<SimilarityConfig>,
}

impl<'a> MatchCascade<'a> {
    pub fn new(index: &'a OfferingIndex<'a>) -> Self {
        Self {
            index,
            similarity: None,
        }
    }

    pub fn with_similarity(mut self, config: SimilarityConfig) -> Self {
        self.similarity = Some(config);
        self
    }

    pub fn resolve(&self, fund: &FundFiling) -> Resolution<'a> {
        let key = fund
            .form_d_file_number
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());
        if let Some(filing) = key.and_then(|k| self.index.by_key(k)) {
            return Resolution::Matched(Match {
                filing,
                method: MatchMethod::Key,
                confidence: 1.0,
            });
        }

        let normalized = normalize_name(fund.fund_name.as_deref().unwrap_or_default());
        if normalized.chars().count() < MIN_NAME_LEN {
            return if key.is_some() {
                Resolution::Unmatched
            } else {
                Resolution::Unusable
            };
        }

        if let Some(filing) = self.index.by_name(&normalized) {
            return Resolution::Matched(Match {
                filing,
                method: MatchMethod::Name,
                confidence: 1.0,
            });
        }

        if let Some(config) = &self.similarity {
            if let Some((filing, score)) = self.most_similar(&normalized, config) {
                return Resolution::Matched(Match {
                    filing,
                    method: MatchMethod::Similarity,
                    confidence: (score * 100.0).round() / 100.0,
                });
            }
        }

        Resolution::Unmatched
    }

    fn most_similar(
        &self,
        normalized: &str,
        config: &SimilarityConfig,
    ) -> Option<(&'a OfferingFiling, f64)> {
        let probe: String = normalized.chars().take(config.probe_len).collect();
        let len = normalized.chars().count();

        // Names starting with the probe come first, then the closest in
        // length; the cap applies to that ranking, not to sort order.
        let mut hits: Vec<(&str, &'a OfferingFiling)> = self
            .index
            .names()
            .filter(|(name, _)| name.contains(probe.as_str()))
            .collect();
        hits.sort_by_key(|(name, _)| {
            (
                !name.starts_with(probe.as_str()),
                name.chars().count().abs_diff(len),
            )
        });

        let mut best: Option<(&'a OfferingFiling, f64)> = None;
        for (name, filing) in hits.into_iter().take(config.max_candidates) {
            let score = similarity(normalized, name);
            if score >= config.threshold && best.map_or(true, |(_, top)| score > top) {
                best = Some((filing, score));
            }
        }

        best
    }
}

/// Per-run counters over cascade outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeStats {
    pub processed: usize,
    pub matched_by_key: usize,
    pub matched_by_name: usize,
    pub matched_by_similarity: usize,
    pub unmatched: usize,
    pub unusable: usize,
}

impl CascadeStats {
    pub fn record(&mut self, resolution: &Resolution<'_>) {
        self.processed += 1;
        match resolution {
            Resolution::Matched(m) => match m.method {
                MatchMethod::Key => self.matched_by_key += 1,
                MatchMethod::Name => self.matched_by_name += 1,
                MatchMethod::Similarity => self.matched_by_similarity += 1,
            },
            Resolution::Unmatched => self.unmatched += 1,
            Resolution::Unusable => self.unusable += 1,
        }
    }

    pub fn matched(&self) -> usize {
        self.matched_by_key + self.matched_by_name + self.matched_by_similarity
    }

    pub fn matched_by(&self, method: MatchMethod) -> usize {
        match method {
            MatchMethod::Key => self.matched_by_key,
            MatchMethod::Name => self.matched_by_name,
            MatchMethod::Similarity => self.matched_by_similarity,
        }
    }
}

/// Classification disagreements between the two sides of a match. Advisory
/// only; never a reason to drop the match.
pub fn check_discrepancies(fund: &FundFiling, filing: &OfferingFiling) -> Vec<&'static str> {
    classification_issues(fund.fund_type.as_deref(), filing.fund_type.as_deref())
}

pub fn classification_issues(adv_type: Option<&str>, formd_type: Option<&str>) -> Vec<&'static str> {
    let adv = adv_type.unwrap_or_default().to_uppercase();
    let formd = formd_type.unwrap_or_default().to_uppercase();
    let mut issues = Vec::new();
    if adv.is_empty() || formd.is_empty() {
        return issues;
    }

    if (adv.contains("PRIVATE EQUITY") && formd.contains("VENTURE"))
        || (adv.contains("VENTURE") && formd.contains("PRIVATE EQUITY"))
    {
        issues.push(PE_VC_MISMATCH);
    }
    if adv.contains("HEDGE") != formd.contains("HEDGE") {
        issues.push(HEDGE_MISMATCH);
    }
    issues
}

pub fn join_issues(issues: &[&str]) -> String {
    issues.join(" | ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverduePolicy {
    pub reporting_year: u16,
    pub earliest_year: u16,
    pub stale_after_years: u16,
}

impl Default for OverduePolicy {
    fn default() -> Self {
        Self::for_reporting_year(2025)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverdueStatus {
    pub latest_year: Option<u16>,
    pub overdue: bool,
}

impl OverduePolicy {
    pub fn for_reporting_year(reporting_year: u16) -> Self {
        Self {
            reporting_year,
            earliest_year: 2011,
            stale_after_years: 2,
        }
    }

    /// Most recent year with a populated gross asset value.
    pub fn latest_active_year(&self, fund: &FundFiling) -> Option<u16> {
        (self.earliest_year..=self.reporting_year)
            .rev()
            .find(|year| fund.has_observation(*year))
    }

    pub fn evaluate(&self, fund: &FundFiling) -> OverdueStatus {
        let latest_year = self.latest_active_year(fund);
        let overdue = latest_year
            .is_some_and(|year| self.reporting_year.saturating_sub(year) >= self.stale_after_years);
        OverdueStatus {
            latest_year,
            overdue,
        }
    }
}
