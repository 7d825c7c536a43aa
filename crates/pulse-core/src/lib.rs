//! Core data model and row normalization for Search Pulse.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "pulse-core";

/// Dimensions requested from the reporting API, in the positional order of `RawAnalyticsRow::keys`.
pub const DIMENSIONS: [&str; 5] = ["page", "query", "device", "country", "searchAppearance"];

/// Canonical URL stored when a `page` key cannot be parsed.
pub const INVALID_URL: &str = "INVALID_URL";
pub const UNKNOWN: &str = "UNKNOWN";
pub const NO_SEARCH_APPEARANCE: &str = "NONE";

const PAGE_KEY: usize = 0;
const QUERY_KEY: usize = 1;
const DEVICE_KEY: usize = 2;
const COUNTRY_KEY: usize = 3;
const SEARCH_APPEARANCE_KEY: usize = 4;

/// One row as returned by the reporting API for a single day.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawAnalyticsRow {
    #[serde(default)]
    pub keys: Vec<Option<String>>,
    #[serde(default)]
    pub clicks: Option<f64>,
    #[serde(default)]
    pub impressions: Option<f64>,
    #[serde(default)]
    pub ctr: Option<f64>,
    #[serde(default)]
    pub position: Option<f64>,
}

impl RawAnalyticsRow {
    /// Dimension value at `index`; empty strings count as absent.
    pub fn key(&self, index: usize) -> Option<&str> {
        self.keys
            .get(index)
            .and_then(|k| k.as_deref())
            .filter(|k| !k.is_empty())
    }
}

/// Canonical, store-ready representation of one analytics row.
///
/// `ingestedAt` is not part of the record: the document store stamps it at commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRecord {
    pub site_property: String,
    pub normalized_url: String,
    pub query: String,
    pub date: NaiveDate,
    pub impressions: f64,
    pub clicks: f64,
    pub position: f64,
    pub ctr: f64,
    pub device: String,
    pub country: String,
    pub search_appearance: String,
}

/// Outcome of one calendar day within an ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DayStatus {
    Written { rows: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayOutcome {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub status: DayStatus,
}

impl DayOutcome {
    pub fn written(date: NaiveDate, rows: usize) -> Self {
        Self {
            date,
            status: DayStatus::Written { rows },
        }
    }

    pub fn failed(date: NaiveDate, error: impl Into<String>) -> Self {
        Self {
            date,
            status: DayStatus::Failed {
                error: error.into(),
            },
        }
    }

    pub fn rows_written(&self) -> usize {
        match self.status {
            DayStatus::Written { rows } => rows,
            DayStatus::Failed { .. } => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, DayStatus::Failed { .. })
    }
}

/// Aggregate result of one orchestration run.
///
/// `success` means the day loop ran to completion; individual day failures are listed in `days`
/// and counted in `failed_days`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionResult {
    pub success: bool,
    pub total_rows_written: usize,
    pub failed_days: usize,
    pub days: Vec<DayOutcome>,
}

impl IngestionResult {
    pub fn invalid_input() -> Self {
        Self {
            success: false,
            total_rows_written: 0,
            failed_days: 0,
            days: Vec::new(),
        }
    }

    pub fn completed(days: Vec<DayOutcome>) -> Self {
        Self {
            success: true,
            total_rows_written: days.iter().map(DayOutcome::rows_written).sum(),
            failed_days: days.iter().filter(|d| d.is_failed()).count(),
            days,
        }
    }

    pub fn all_days_succeeded(&self) -> bool {
        self.success && self.failed_days == 0
    }
}

/// Every calendar day in `[start, end]`, ascending. Empty when `start > end`.
pub fn days_inclusive(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |day| *day <= end)
}

/// Map a raw API row onto the canonical schema. Never fails.
pub fn normalize_row(row: &RawAnalyticsRow, site_property: &str, date: NaiveDate) -> NormalizedRecord {
    NormalizedRecord {
        site_property: site_property.to_string(),
        normalized_url: normalize_url(row.key(PAGE_KEY).unwrap_or_default()),
        query: row.key(QUERY_KEY).unwrap_or_default().to_string(),
        date,
        impressions: measure(row.impressions),
        clicks: measure(row.clicks),
        position: measure(row.position),
        ctr: measure(row.ctr),
        device: row.key(DEVICE_KEY).unwrap_or(UNKNOWN).to_string(),
        country: row
            .key(COUNTRY_KEY)
            .map(str::to_uppercase)
            .unwrap_or_else(|| UNKNOWN.to_string()),
        search_appearance: row
            .key(SEARCH_APPEARANCE_KEY)
            .unwrap_or(NO_SEARCH_APPEARANCE)
            .to_string(),
    }
}

fn measure(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Canonicalize a page URL.
///
/// Drops `utm_*` parameters, lower-cases scheme, host and path, strips one trailing slash
/// (the root path included) and drops the fragment. Anything that does not parse as an
/// absolute URL with a host becomes [`INVALID_URL`].
pub fn normalize_url(input: &str) -> String {
    let input = input.trim();
    if input.is_empty() {
        return INVALID_URL.to_string();
    }
    let Ok(parsed) = Url::parse(input) else {
        return INVALID_URL.to_string();
    };
    let Some(host) = parsed.host_str().filter(|h| !h.is_empty()) else {
        return INVALID_URL.to_string();
    };

    let mut out = String::with_capacity(input.len());
    out.push_str(parsed.scheme());
    out.push_str("://");
    if !parsed.username().is_empty() {
        out.push_str(parsed.username());
        if let Some(password) = parsed.password() {
            out.push(':');
            out.push_str(password);
        }
        out.push('@');
    }
    out.push_str(&host.to_ascii_lowercase());
    if let Some(port) = parsed.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }

    let path = parsed.path().to_lowercase();
    out.push_str(path.strip_suffix('/').unwrap_or(&path));

    let kept = parsed
        .query()
        .map(|query| {
            query
                .split('&')
                .filter(|pair| !pair.is_empty() && !is_tracking_param(pair))
                .collect::<Vec<_>>()
                .join("&")
        })
        .unwrap_or_default();
    if !kept.is_empty() {
        out.push('?');
        out.push_str(&kept);
    }

    out
}

fn is_tracking_param(pair: &str) -> bool {
    let name = pair.split('=').next().unwrap_or_default();
    name.get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("utm_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 14).expect("date")
    }

    fn row(keys: &[Option<&str>]) -> RawAnalyticsRow {
        RawAnalyticsRow {
            keys: keys.iter().map(|k| k.map(str::to_string)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn url_canonicalization_matches_documented_pairs() {
        let cases = [
            (
                "https://example.com/page?utm_source=google&utm_medium=cpc&other=param",
                "https://example.com/page?other=param",
            ),
            ("https://EXAMPLE.com/PAGE", "https://example.com/page"),
            ("https://example.com/page/", "https://example.com/page"),
            ("https://example.com/", "https://example.com"),
            ("https://example.com", "https://example.com"),
            (
                "https://WWW.Example.Com/Some/Path/?utm_campaign=test&id=123",
                "https://www.example.com/some/path?id=123",
            ),
            ("not a valid url", INVALID_URL),
            (
                "https://example.com/page?a=1&utm_source=google&b=2&utm_medium=cpc",
                "https://example.com/page?a=1&b=2",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_url(input), expected, "input: {input}");
        }
    }

    #[test]
    fn canonical_urls_are_fixed_points() {
        for input in [
            "https://example.com/page?other=param",
            "https://example.com",
            "https://www.example.com/some/path?id=123",
            "http://example.com:8080/a/b?x=1&y=2",
            "https://EXAMPLE.com/Docs/?UTM_Source=x&keep=Me",
        ] {
            let once = normalize_url(input);
            assert_eq!(normalize_url(&once), once, "input: {input}");
        }
    }

    #[test]
    fn tracking_prefix_is_case_insensitive_and_values_are_untouched() {
        assert_eq!(
            normalize_url("https://example.com/a?UTM_Source=x&Keep=MiXeD&utm=1"),
            "https://example.com/a?Keep=MiXeD&utm=1"
        );
    }

    #[test]
    fn fragments_are_dropped_and_ports_kept() {
        assert_eq!(
            normalize_url("https://example.com:8443/Guide/#Section"),
            "https://example.com:8443/guide"
        );
    }

    #[test]
    fn only_one_trailing_slash_is_stripped() {
        let once = normalize_url("https://example.com/page//");
        assert_eq!(once, "https://example.com/page/");
        assert_eq!(normalize_url(&once), "https://example.com/page");
    }

    #[test]
    fn empty_and_hostless_inputs_degrade_to_sentinel() {
        assert_eq!(normalize_url(""), INVALID_URL);
        assert_eq!(normalize_url("   "), INVALID_URL);
        assert_eq!(normalize_url("/relative/path"), INVALID_URL);
        assert_eq!(normalize_url("mailto:someone@example.com"), INVALID_URL);
    }

    #[test]
    fn query_with_only_tracking_params_loses_question_mark() {
        assert_eq!(
            normalize_url("https://example.com/landing?utm_source=a&utm_medium=b"),
            "https://example.com/landing"
        );
    }

    #[test]
    fn normalize_row_applies_field_defaults() {
        let record = normalize_row(&row(&[Some("https://Example.com/Blog/")]), "sc-domain:example.com", day());

        assert_eq!(record.site_property, "sc-domain:example.com");
        assert_eq!(record.normalized_url, "https://example.com/blog");
        assert_eq!(record.query, "");
        assert_eq!(record.device, UNKNOWN);
        assert_eq!(record.country, UNKNOWN);
        assert_eq!(record.search_appearance, NO_SEARCH_APPEARANCE);
        assert_eq!(record.impressions, 0.0);
        assert_eq!(record.clicks, 0.0);
        assert_eq!(record.position, 0.0);
        assert_eq!(record.ctr, 0.0);
        assert_eq!(record.date, day());
    }

    #[test]
    fn normalize_row_reads_keys_positionally() {
        let raw = RawAnalyticsRow {
            keys: vec![
                Some("https://example.com/pricing?utm_source=x".into()),
                Some("cheap widgets".into()),
                Some("MOBILE".into()),
                Some("deu".into()),
                Some("AMP_BLUE_LINK".into()),
            ],
            clicks: Some(3.0),
            impressions: Some(120.0),
            ctr: Some(0.025),
            position: Some(7.4),
        };
        let record = normalize_row(&raw, "https://example.com/", day());

        assert_eq!(record.normalized_url, "https://example.com/pricing");
        assert_eq!(record.query, "cheap widgets");
        assert_eq!(record.device, "MOBILE");
        assert_eq!(record.country, "DEU");
        assert_eq!(record.search_appearance, "AMP_BLUE_LINK");
        assert_eq!(record.clicks, 3.0);
        assert_eq!(record.impressions, 120.0);
        assert_eq!(record.ctr, 0.025);
        assert_eq!(record.position, 7.4);
    }

    #[test]
    fn empty_and_null_keys_count_as_missing() {
        let record = normalize_row(&row(&[None, Some(""), None, Some("")]), "site", day());
        assert_eq!(record.normalized_url, INVALID_URL);
        assert_eq!(record.query, "");
        assert_eq!(record.country, UNKNOWN);
    }

    #[test]
    fn record_serializes_with_camel_case_and_iso_date() {
        let record = normalize_row(&row(&[Some("https://example.com/a")]), "site", day());
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["normalizedUrl"], "https://example.com/a");
        assert_eq!(json["searchAppearance"], NO_SEARCH_APPEARANCE);
        assert_eq!(json["date"], "2024-03-14");
    }

    #[test]
    fn raw_rows_deserialize_from_api_shape() {
        let raw: RawAnalyticsRow = serde_json::from_str(
            r#"{"keys":["https://example.com/","q","DESKTOP","usa","NONE"],"clicks":1,"impressions":10}"#,
        )
        .expect("row");
        assert_eq!(raw.key(3), Some("usa"));
        assert_eq!(raw.position, None);
    }

    #[test]
    fn day_iteration_is_inclusive_and_ascending() {
        let start = NaiveDate::from_ymd_opt(2024, 2, 28).expect("start");
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).expect("end");
        let days: Vec<_> = days_inclusive(start, end).collect();
        assert_eq!(days.len(), 3);
        assert_eq!(days[1], NaiveDate::from_ymd_opt(2024, 2, 29).expect("leap"));
        assert_eq!(days_inclusive(end, start).count(), 0);
    }

    #[test]
    fn completed_result_totals_written_days_only() {
        let result = IngestionResult::completed(vec![
            DayOutcome::written(day(), 10),
            DayOutcome::failed(day().succ_opt().expect("next"), "boom"),
            DayOutcome::written(day() + chrono::Days::new(2), 5),
        ]);
        assert!(result.success);
        assert_eq!(result.total_rows_written, 15);
        assert_eq!(result.failed_days, 1);
        assert!(!result.all_days_succeeded());

        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["totalRowsWritten"], 15);
        assert_eq!(json["days"][1]["status"], "failed");
        assert_eq!(json["days"][1]["error"], "boom");
    }
}
