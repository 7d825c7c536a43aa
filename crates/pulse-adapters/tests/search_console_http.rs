use std::sync::Arc;

use chrono::NaiveDate;
use pulse_adapters::{AnalyticsApi, AnalyticsQuery, FetcherConfig, PaginatedFetcher, SearchConsoleClient};
use pulse_storage::{RecordingSleeper, StaticTokenProvider};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const QUERY_PATH: &str = "/webmasters/v3/sites/sc-domain%3Aexample.com/searchAnalytics/query";

fn client(server: &MockServer) -> SearchConsoleClient {
    SearchConsoleClient::with_base_url(
        reqwest::Client::new(),
        Arc::new(StaticTokenProvider("test-token".into())),
        server.uri(),
    )
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 30).expect("date")
}

#[tokio::test]
async fn query_posts_one_day_window_and_decodes_rows() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(QUERY_PATH))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({
            "startDate": "2024-06-30",
            "endDate": "2024-06-30",
            "dimensions": ["page", "query", "device", "country", "searchAppearance"],
            "rowLimit": 25000,
            "startRow": 0,
            "type": "web"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [
                { "keys": ["https://example.com/a", "widgets", "MOBILE", "usa", "NONE"],
                  "clicks": 4, "impressions": 90, "ctr": 0.044, "position": 3.2 },
                { "keys": ["https://example.com/b", "gadgets", "DESKTOP", "gbr", "NONE"],
                  "impressions": 12 }
            ],
            "responseAggregationType": "byPage"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let rows = client(&server)
        .query("sc-domain:example.com", &AnalyticsQuery::for_day(day(), 25_000, 0))
        .await
        .expect("rows");

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].key(1), Some("widgets"));
    assert_eq!(rows[0].clicks, Some(4.0));
    assert_eq!(rows[1].clicks, None);
}

#[tokio::test]
async fn missing_rows_field_means_no_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(QUERY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "responseAggregationType": "auto" })))
        .mount(&server)
        .await;

    let rows = client(&server)
        .query("sc-domain:example.com", &AnalyticsQuery::for_day(day(), 100, 0))
        .await
        .expect("rows");
    assert!(rows.is_empty());
}

#[tokio::test]
async fn server_errors_are_retryable_and_permission_errors_are_not() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(QUERY_PATH))
        .and(body_partial_json(json!({ "startRow": 0 })))
        .respond_with(ResponseTemplate::new(503).set_body_string("backend error"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(QUERY_PATH))
        .and(body_partial_json(json!({ "startRow": 1 })))
        .respond_with(ResponseTemplate::new(403).set_body_string("user does not have access"))
        .mount(&server)
        .await;

    let api = client(&server);
    let unavailable = api
        .query("sc-domain:example.com", &AnalyticsQuery::for_day(day(), 10, 0))
        .await
        .expect_err("503");
    assert!(unavailable.is_retryable());
    assert!(unavailable.message.contains("503"));

    let forbidden = api
        .query("sc-domain:example.com", &AnalyticsQuery::for_day(day(), 10, 1))
        .await
        .expect_err("403");
    assert!(!forbidden.is_retryable());
}

#[tokio::test]
async fn fetcher_pages_through_live_endpoint() {
    let server = MockServer::start().await;
    let row = |n: usize| json!({ "keys": [format!("https://example.com/{n}"), "q", "DESKTOP", "usa", "NONE"], "clicks": 1 });
    Mock::given(method("POST"))
        .and(path(QUERY_PATH))
        .and(body_partial_json(json!({ "startRow": 0 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rows": [row(0), row(1)] })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(QUERY_PATH))
        .and(body_partial_json(json!({ "startRow": 2 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rows": [row(2)] })))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = PaginatedFetcher::new(
        Arc::new(client(&server)),
        Arc::new(RecordingSleeper::default()),
        FetcherConfig {
            row_limit: 2,
            ..FetcherConfig::default()
        },
    );
    let rows = fetcher.fetch("sc-domain:example.com", day()).await.expect("rows");

    let urls: Vec<_> = rows.iter().map(|r| r.key(0).unwrap_or_default().to_string()).collect();
    assert_eq!(
        urls,
        vec!["https://example.com/0", "https://example.com/1", "https://example.com/2"]
    );
}
