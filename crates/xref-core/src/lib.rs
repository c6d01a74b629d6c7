//! Core domain model for the fund filing cross-reference.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "xref-core";

/// Adviser-side fund filing (Source A). Year-keyed gross asset values arrive
/// as `gav_{year}` columns and are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FundFiling {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub reference_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub fund_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub fund_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub fund_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub adviser_entity_crd: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub form_d_file_number: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub latest_gross_asset_value: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl FundFiling {
    pub fn gross_asset_value(&self, year: u16) -> Option<&JsonValue> {
        self.extra.get(&format!("gav_{year}"))
    }

    /// True when the `gav_{year}` column holds a non-zero number or a
    /// non-empty string.
    pub fn has_observation(&self, year: u16) -> bool {
        match self.gross_asset_value(year) {
            Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            Some(JsonValue::String(s)) => !s.trim().is_empty(),
            _ => false,
        }
    }
}

/// Private-offering filing (Source B).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OfferingFiling {
    #[serde(rename = "accessionnumber", default, deserialize_with = "lenient::opt_string")]
    pub accession_number: Option<String>,
    #[serde(rename = "entityname", default, deserialize_with = "lenient::opt_string")]
    pub entity_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub filing_date: Option<String>,
    #[serde(rename = "totalofferingamount", default, deserialize_with = "lenient::opt_f64")]
    pub offering_amount: Option<f64>,
    #[serde(rename = "totalamountsold", default, deserialize_with = "lenient::opt_f64")]
    pub amount_sold: Option<f64>,
    #[serde(rename = "investmentfundtype", default, deserialize_with = "lenient::opt_string")]
    pub fund_type: Option<String>,
    #[serde(rename = "file_num", default, deserialize_with = "lenient::opt_string")]
    pub file_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Adviser {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub crd: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub adviser_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub primary_website: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient::opt_string")]
    pub adviser_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub total_aum: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub aum_2025: Option<f64>,
}

/// Strategy that produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    Key,
    Name,
    Similarity,
}

impl MatchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchMethod::Key => "key",
            MatchMethod::Name => "name",
            MatchMethod::Similarity => "similarity",
        }
    }
}

/// Persisted row of the `cross_reference_matches` output table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub formd_accession: Option<String>,
    pub formd_entity_name: Option<String>,
    pub formd_filing_date: Option<String>,
    pub formd_offering_amount: Option<f64>,
    pub adv_fund_id: Option<String>,
    pub adv_fund_name: Option<String>,
    pub adv_filing_date: Option<String>,
    pub adv_gav: Option<f64>,
    pub adviser_entity_crd: Option<String>,
    pub adviser_entity_legal_name: Option<String>,
    pub match_score: f64,
    pub issues: String,
    pub overdue_adv_flag: bool,
    pub latest_adv_year: Option<u16>,
    pub computed_at: DateTime<Utc>,
}

/// Deserializers for remote columns whose JSON type is not stable
/// (identifiers that are sometimes numbers, amounts that are sometimes text).
pub mod lenient {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value as JsonValue;

    pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<JsonValue>::deserialize(deserializer)? {
            None | Some(JsonValue::Null) => Ok(None),
            Some(JsonValue::String(s)) => Ok(Some(s)),
            Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
            Some(JsonValue::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(D::Error::custom(format!(
                "expected a scalar, found {other}"
            ))),
        }
    }

    pub fn opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<JsonValue>::deserialize(deserializer)? {
            Some(JsonValue::Number(n)) => n.as_f64(),
            Some(JsonValue::String(s)) => s.trim().replace(',', "").parse::<f64>().ok(),
            _ => None,
        })
    }
}
