//! grants.gov wire contracts, the upstream source trait and normalization.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use grantflow_storage::{FetchError, FetchOutcome, FetchRequest, HttpFetcher};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod normalize;

pub use normalize::{
    clean_text, detail_from_data, envelope_data, parse_count, parse_date, parse_flag,
    parse_money, scrub_contact, NormalizeError,
};

pub const CRATE_NAME: &str = "grantflow-adapters";

pub const SEARCH_PATH: &str = "/v1/api/search2";
pub const DETAIL_PATH: &str = "/v1/api/fetchOpportunity";

/// One search strategy run on every discovery tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub name: String,
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub cfda: Option<String>,
}

impl SearchQuery {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// `page` is 1-based.
    pub fn query_pairs(&self, page: u32, rows: u32) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (key, value) in [
            ("keyword", &self.keyword),
            ("agency", &self.agency),
            ("cfda", &self.cfda),
        ] {
            if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                pairs.push((key.to_string(), value.trim().to_string()));
            }
        }
        pairs.push(("page".to_string(), page.to_string()));
        pairs.push(("rows".to_string(), rows.to_string()));
        pairs
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(normalize::json_text(&JsonValue::deserialize(deserializer)?))
}

fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(parse_flag(&JsonValue::deserialize(deserializer)?))
}

/// Entry of `data.oppHits` in a search response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub number: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(default, alias = "agencyName", deserialize_with = "lenient_string")]
    pub agency: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub agency_code: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub open_date: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub close_date: String,
    #[serde(default, alias = "lastUpdated", deserialize_with = "lenient_string")]
    pub last_updated_date: String,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub cost_sharing: bool,
    #[serde(default, deserialize_with = "lenient_string")]
    pub opp_status: String,
}

impl SearchHit {
    pub fn close_date(&self) -> Option<NaiveDate> {
        parse_date(&self.close_date)
    }

    pub fn last_updated(&self) -> Option<NaiveDate> {
        parse_date(&self.last_updated_date)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    #[serde(default)]
    hit_count: Option<u64>,
    #[serde(default)]
    opp_hits: Vec<SearchHit>,
}

/// One decoded page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    /// `None` when the response carried no `hitCount`.
    pub hit_count: Option<u64>,
    pub hits: Vec<SearchHit>,
}

impl SearchPage {
    pub fn from_json(body: &JsonValue) -> Result<Self, NormalizeError> {
        let data = envelope_data(body)?;
        let data: SearchData = serde_json::from_value(data.clone())
            .map_err(|e| NormalizeError::Shape(e.to_string()))?;
        Ok(Self {
            hit_count: data.hit_count,
            hits: data.opp_hits,
        })
    }

    /// Number of pages implied by `hit_count` at `rows` per page, if the server reported one.
    pub fn last_page(&self, rows: u32) -> Option<u32> {
        let rows = u64::from(rows.max(1));
        self.hit_count
            .map(|count| u32::try_from(count.div_ceil(rows)).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed search response: {0}")]
    Malformed(#[from] NormalizeError),
}

/// The upstream opportunity API.
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// `page` is 1-based.
    async fn search_page(
        &self,
        query: &SearchQuery,
        page: u32,
        rows: u32,
    ) -> Result<SearchPage, SourceError>;

    /// Raw detail response; callers archive it before normalizing.
    async fn fetch_detail(&self, id: &str) -> Result<FetchOutcome, FetchError>;
}

#[derive(Debug, Clone)]
pub struct GrantsGovClient {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
}

impl GrantsGovClient {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { fetcher, base_url }
    }

    pub fn fetcher(&self) -> &Arc<HttpFetcher> {
        &self.fetcher
    }

    pub fn search_url(&self) -> String {
        format!("{}{SEARCH_PATH}", self.base_url)
    }

    pub fn detail_url(&self, id: &str) -> String {
        format!("{}{DETAIL_PATH}/{}", self.base_url, id.trim())
    }
}

#[async_trait]
impl OpportunitySource for GrantsGovClient {
    fn source_id(&self) -> &'static str {
        "grants-gov"
    }

    async fn search_page(
        &self,
        query: &SearchQuery,
        page: u32,
        rows: u32,
    ) -> Result<SearchPage, SourceError> {
        let mut request = FetchRequest::get(
            format!("search:{}:{page}", query.name),
            self.search_url(),
        );
        for (key, value) in query.query_pairs(page, rows) {
            request = request.with_query(key, value);
        }
        let outcome = self.fetcher.fetch_json(&request).await?;
        Ok(SearchPage::from_json(&outcome.json)?)
    }

    async fn fetch_detail(&self, id: &str) -> Result<FetchOutcome, FetchError> {
        let request = FetchRequest::get(format!("detail:{id}"), self.detail_url(id));
        self.fetcher.fetch_json(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_pairs_skip_blank_filters() {
        let query = SearchQuery {
            name: "health".into(),
            keyword: Some("rural health".into()),
            agency: Some("  ".into()),
            cfda: None,
        };
        assert_eq!(
            query.query_pairs(2, 25),
            vec![
                ("keyword".to_string(), "rural health".to_string()),
                ("page".to_string(), "2".to_string()),
                ("rows".to_string(), "25".to_string()),
            ]
        );
    }

    #[test]
    fn search_page_decodes_numeric_ids_and_flag_strings() {
        let page = SearchPage::from_json(&json!({
            "errorcode": 0,
            "msg": "Webservice Succeeds",
            "data": {
                "hitCount": 51,
                "oppHits": [
                    {"id": 355012, "title": "A", "agencyName": "HHS", "closeDate": "05/01/2026", "costSharing": "No"},
                    {"id": "355013", "title": null, "closeDate": null, "costSharing": true}
                ]
            }
        }))
        .unwrap();

        assert_eq!(page.hits[0].id, "355012");
        assert_eq!(page.hits[0].agency, "HHS");
        assert_eq!(page.hits[0].close_date(), NaiveDate::from_ymd_opt(2026, 5, 1));
        assert!(!page.hits[0].cost_sharing);
        assert_eq!(page.hits[1].title, "");
        assert_eq!(page.hits[1].close_date(), None);
        assert!(page.hits[1].cost_sharing);
        assert_eq!(page.last_page(25), Some(3));
    }

    #[test]
    fn search_page_without_hits_is_empty() {
        let page = SearchPage::from_json(&json!({"errorcode": 0, "data": {}})).unwrap();
        assert_eq!(page.hit_count, None);
        assert!(page.hits.is_empty());
        assert_eq!(page.last_page(25), None);
    }

    #[test]
    fn client_urls_ignore_trailing_slash() {
        let fetcher = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let client = GrantsGovClient::new(fetcher, "https://api.grants.gov/");
        assert_eq!(client.search_url(), "https://api.grants.gov/v1/api/search2");
        assert_eq!(
            client.detail_url("355012"),
            "https://api.grants.gov/v1/api/fetchOpportunity/355012"
        );
    }
}
