use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use grantflow_adapters::{OpportunitySource, SearchHit, SearchQuery};
use grantflow_core::{OpportunityRef, Watermark};
use tracing::{info, warn};

/// Result of one discovery pass over every configured query.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryRun {
    pub refs: Vec<OpportunityRef>,
    pub pages_fetched: u32,
    /// Every page of every query was consumed without a fatal error.
    pub complete: bool,
    pub failure: Option<String>,
    /// Set only for complete runs.
    pub next_watermark: Option<Watermark>,
}

/// Still open, or rolling and touched this calendar year. Cost-sharing
/// opportunities are never selected.
pub fn in_window(hit: &SearchHit, today: NaiveDate) -> bool {
    if hit.cost_sharing {
        return false;
    }
    match hit.close_date() {
        Some(close) => close >= today,
        None => hit
            .last_updated()
            .is_some_and(|updated| updated.year() == today.year()),
    }
}

/// A hit last updated before the previous run's day has nothing new to fetch.
pub fn unchanged_since(hit: &SearchHit, watermark: &Watermark) -> bool {
    match (watermark.last_discovery_run_at, hit.last_updated()) {
        (Some(last_run), Some(updated)) => updated < last_run.date_naive(),
        _ => false,
    }
}

pub struct Discovery {
    source: Arc<dyn OpportunitySource>,
    max_pages: u32,
    rows: u32,
}

impl Discovery {
    pub fn new(source: Arc<dyn OpportunitySource>, max_pages: u32, rows: u32) -> Self {
        Self {
            source,
            max_pages: max_pages.max(1),
            rows: rows.max(1),
        }
    }

    pub async fn discover(
        &self,
        queries: &[SearchQuery],
        watermark: &Watermark,
        today: NaiveDate,
        run_at: DateTime<Utc>,
    ) -> DiscoveryRun {
        let mut seen = HashSet::new();
        let mut refs = Vec::new();
        let mut pages_fetched = 0u32;
        let mut max_close_date: Option<NaiveDate> = None;
        let mut failure = None;

        'queries: for query in queries {
            let mut page = 1u32;
            loop {
                if page > self.max_pages {
                    warn!(
                        query = %query.name,
                        max_pages = self.max_pages,
                        "page limit reached; remaining results wait for the next tick"
                    );
                    break;
                }
                let result = match self.source.search_page(query, page, self.rows).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(query = %query.name, page, error = %err, "search page failed");
                        failure = Some(format!("{} page {page}: {err}", query.name));
                        break 'queries;
                    }
                };
                pages_fetched += 1;
                if result.hits.is_empty() {
                    break;
                }

                for hit in &result.hits {
                    if hit.id.is_empty() || !in_window(hit, today) || unchanged_since(hit, watermark)
                    {
                        continue;
                    }
                    if let Some(close) = hit.close_date() {
                        max_close_date = Some(max_close_date.map_or(close, |m| m.max(close)));
                    }
                    if seen.insert(hit.id.clone()) {
                        refs.push(OpportunityRef::new(hit.id.clone(), run_at));
                    }
                }

                // Without a hit count only an empty page or the page limit ends the query.
                if result.last_page(self.rows).is_some_and(|last| page >= last) {
                    break;
                }
                page += 1;
            }
        }

        let complete = failure.is_none();
        info!(
            refs = refs.len(),
            pages_fetched,
            complete,
            "discovery pass finished"
        );
        DiscoveryRun {
            refs,
            pages_fetched,
            complete,
            failure,
            next_watermark: complete.then(|| watermark.advanced(run_at, max_close_date)),
        }
    }
}
