use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use grantflow_adapters::{
    detail_from_data, envelope_data, GrantsGovClient, OpportunitySource, SearchQuery, SourceError,
};
use grantflow_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> GrantsGovClient {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            initial_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_attempts: 2,
            jitter_fraction: 0.0,
            max_delay: Duration::from_millis(50),
        },
        jitter_seed: Some(1),
        ..Default::default()
    })
    .unwrap();
    GrantsGovClient::new(Arc::new(fetcher), server.uri())
}

#[tokio::test]
async fn search_page_sends_filters_and_decodes_hits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/api/search2"))
        .and(query_param("agency", "NSF"))
        .and(query_param("page", "1"))
        .and(query_param("rows", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorcode": 0,
            "data": {"hitCount": 1, "oppHits": [{"id": 42, "title": "Polar Science"}]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let query = SearchQuery {
        agency: Some("NSF".into()),
        ..SearchQuery::named("nsf")
    };
    let page = client(&server).search_page(&query, 1, 10).await.unwrap();
    assert_eq!(page.hit_count, Some(1));
    assert_eq!(page.hits[0].id, "42");
    assert_eq!(page.hits[0].title, "Polar Science");
}

#[tokio::test]
async fn search_page_with_upstream_errorcode_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/api/search2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"errorcode": 2, "msg": "bad rows"})),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .search_page(&SearchQuery::named("all"), 1, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Malformed(_)), "{err}");
}

#[tokio::test]
async fn fetched_detail_normalizes_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/api/fetchOpportunity/355012"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errorcode": 0,
            "data": {
                "id": 355012,
                "opportunityTitle": "Rural Health Outreach",
                "synopsis": {
                    "agencyName": "HRSA",
                    "responseDate": "Jun 30, 2026 12:00:00 AM EDT",
                    "awardCeiling": "$300,000",
                    "agencyContactDesc": "Questions go to the program office at grants@hrsa.gov"
                }
            }
        })))
        .mount(&server)
        .await;

    let outcome = client(&server).fetch_detail("355012").await.unwrap();
    assert_eq!(outcome.attempts.len(), 1);

    let data = envelope_data(&outcome.json).unwrap();
    let detail = detail_from_data("355012", data, Utc::now()).unwrap();
    assert_eq!(detail.title, "Rural Health Outreach");
    assert_eq!(detail.deadline, "2026-06-30");
    assert_eq!(detail.award_ceiling, 300_000.0);
    assert!(!detail.contact.contains('@'));
    assert!(detail.contact.contains("program office"));
}
