//! Field-level cleanup applied to grants.gov payloads before they reach the store.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use grantflow_core::OpportunityDetail;
use regex::Regex;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Longest text kept for any free-text field.
pub const MAX_TEXT_CHARS: usize = 32_000;
const TRUNCATION_MARKER: &str = "... (truncated)";

pub const DETAIL_PAGE_BASE: &str = "https://www.grants.gov/search-results-detail";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("upstream errorcode {code}: {message}")]
    Upstream { code: String, message: String },
    #[error("response has no data object")]
    MissingData,
    #[error("unexpected data shape: {0}")]
    Shape(String),
}

static RE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("static regex"));
static RE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        \b(?:https?://|www\.)[^\s<>()]+
        | \bmailto:[^\s<>()]*
        | \b[a-z0-9-]+(?:\.[a-z0-9-]+)*\.[a-z]{2,}/[^\s<>()]*",
    )
    .expect("static regex")
});
static RE_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex")
});
static RE_PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:\b(?:phone|telephone|tel|fax)\b\.?(?:\s+number)?\s*:?\s*)?(?:\+?1[\s.-]?)?(?:\(\d{3}\)|\b\d{3})[\s.-]?\d{3}[\s.-]?\d{4}\b(?:\s*(?:x|ext\.?)\s*\d+)?",
    )
    .expect("static regex")
});
static RE_BOILERPLATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        (?:for\s+(?:further|more|additional)\s+information,?\s*)?
        please\s+(?:contact|e-?mail|call|visit|send\s+inquiries\s+to)(?:\s+us)?(?:\s+at)?:?
        | \b(?:contact|inquiries)\s+(?:us\s+)?(?:by|via)\s+(?:e-?mail|phone|telephone)(?:\s+at)?:?
        | \b(?:e-?mail|phone|telephone|tel|fax|website|web\s+site|url)\s*(?:address|number)?\s*:
        | \bfax\b\.?",
    )
    .expect("static regex")
});
static RE_EMPTY_BRACKETS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\s*[,;:]?\s*\)|\[\s*\]").expect("static regex"));
static RE_HSPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{a0}\r\f\v]+").expect("static regex"));
static RE_SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" +([.,;:])").expect("static regex"));

/// Removes NUL characters and truncates to [`MAX_TEXT_CHARS`].
pub fn clean_text(text: &str) -> String {
    let text = text.replace('\0', "");
    if text.chars().count() <= MAX_TEXT_CHARS {
        return text;
    }
    let mut out: String = text.chars().take(MAX_TEXT_CHARS).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Strips emails, phone numbers, URLs and contact-instruction boilerplate.
///
/// Horizontal whitespace collapses to single spaces. Each non-empty line is
/// a paragraph; runs of blank lines collapse to a single `\n`.
pub fn scrub_contact(text: &str) -> String {
    let text = RE_BREAK.replace_all(text, "\n");
    let text = RE_EMAIL.replace_all(&text, " ");
    let text = RE_URL.replace_all(&text, " ");
    let text = RE_PHONE.replace_all(&text, " ");
    let text = RE_BOILERPLATE.replace_all(&text, " ");
    let text = RE_EMPTY_BRACKETS.replace_all(&text, " ");

    let paragraphs: Vec<String> = text
        .lines()
        .map(|line| {
            let line = RE_HSPACE.replace_all(line, " ");
            RE_SPACE_BEFORE_PUNCT
                .replace_all(&line, "$1")
                .trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | ':'))
                .trim_start_matches(|c: char| c.is_whitespace() || c == '.')
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .collect();
    clean_text(&paragraphs.join("\n"))
}

fn numeric_text(raw: &str) -> Option<String> {
    if !raw.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(
        raw.chars()
            .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
            .collect(),
    )
}

/// Dollar amounts. Null, sentinels such as `"N/A"`, negatives and
/// unparseable values all become `0.0`.
pub fn parse_money(value: &JsonValue) -> f64 {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => numeric_text(s).and_then(|s| s.parse::<f64>().ok()),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() && v > 0.0 => v,
        _ => 0.0,
    }
}

/// Whole counts with the same fallbacks as [`parse_money`]; fractions truncate.
pub fn parse_count(value: &JsonValue) -> u32 {
    let amount = parse_money(value);
    if amount >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        amount.trunc() as u32
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%b %d, %Y", "%B %d, %Y"];

/// Parses the date formats grants.gov has been seen to emit. A trailing time
/// portion (`T...` or a space-separated clock) is ignored.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        let month = raw[0..2].parse().ok()?;
        let day = raw[2..4].parse().ok()?;
        let year = raw[4..8].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    DATE_FORMATS.iter().find_map(|fmt| {
        let (date, rest) = NaiveDate::parse_and_remainder(raw, fmt).ok()?;
        (rest.is_empty() || rest.starts_with(' ') || rest.starts_with('T')).then_some(date)
    })
}

/// Accepts booleans, `"Yes"`/`"Y"`/`"true"` strings and non-zero numbers.
pub fn parse_flag(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        JsonValue::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "yes" | "y" | "true" | "1"
        ),
        _ => false,
    }
}

/// Renders scalars as text; null and containers become empty.
pub fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Returns the `data` object of a `{"errorcode":0,"data":{...}}` envelope.
pub fn envelope_data(body: &JsonValue) -> Result<&JsonValue, NormalizeError> {
    let code = body.get("errorcode").map(json_text).unwrap_or_default();
    if code != "0" {
        let message = body.get("msg").map(json_text).unwrap_or_default();
        return Err(NormalizeError::Upstream {
            code: if code.is_empty() { "missing".into() } else { code },
            message,
        });
    }
    match body.get("data") {
        Some(data) if data.is_object() => Ok(data),
        _ => Err(NormalizeError::MissingData),
    }
}

fn lookup<'a>(data: &'a JsonValue, paths: &[&[&str]]) -> Option<&'a JsonValue> {
    paths.iter().find_map(|path| {
        let mut cur = data;
        for segment in *path {
            cur = cur.get(*segment)?;
        }
        (!cur.is_null()).then_some(cur)
    })
}

fn text_at(data: &JsonValue, paths: &[&[&str]]) -> String {
    lookup(data, paths)
        .map(|v| clean_text(&json_text(v)))
        .unwrap_or_default()
}

fn money_at(data: &JsonValue, paths: &[&[&str]]) -> f64 {
    lookup(data, paths).map(parse_money).unwrap_or(0.0)
}

fn date_at(data: &JsonValue, paths: &[&[&str]]) -> Option<NaiveDate> {
    lookup(data, paths).and_then(|v| parse_date(&json_text(v)))
}

fn first_description(data: &JsonValue, paths: &[&[&str]]) -> String {
    match lookup(data, paths) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| item.get("description").map(json_text).unwrap_or_else(|| json_text(item)))
            .find(|s| !s.is_empty())
            .map(|s| clean_text(&s))
            .unwrap_or_default(),
        Some(other) => clean_text(&json_text(other)),
        None => String::new(),
    }
}

fn cfda_numbers(data: &JsonValue) -> Vec<String> {
    let from_list = |items: &Vec<JsonValue>| -> Vec<String> {
        items
            .iter()
            .map(|item| {
                item.get("cfdaNumber")
                    .map(json_text)
                    .unwrap_or_else(|| json_text(item))
            })
            .filter(|s| !s.is_empty())
            .collect()
    };
    match lookup(data, &[&["cfdaList"], &["cfdas"], &["cfda"], &["cfdaNumber"]]) {
        Some(JsonValue::Array(items)) => from_list(items),
        Some(other) => json_text(other)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => Vec::new(),
    }
}

fn contact_text(data: &JsonValue) -> String {
    if let Some(contact) = lookup(data, &[&["contact"], &["agencyContactInfo"]]) {
        if contact.is_string() {
            return scrub_contact(&json_text(contact));
        }
    }
    let parts: Vec<String> = [
        "agencyContactName",
        "agencyContactDesc",
        "agencyContactPhone",
        "agencyContactEmail",
        "agencyContactEmailDesc",
    ]
    .iter()
    .filter_map(|key| lookup(data, &[&["synopsis", *key], &[*key]]))
    .map(json_text)
    .filter(|s| !s.is_empty())
    .collect();
    scrub_contact(&parts.join("\n"))
}

/// Builds the canonical record from a detail response's `data` object.
///
/// `id` is the identifier the work item carried; it wins over whatever the
/// payload reports so re-fetches stay keyed the same way.
pub fn detail_from_data(
    id: &str,
    data: &JsonValue,
    fetched_at: DateTime<Utc>,
) -> Result<OpportunityDetail, NormalizeError> {
    if !data.is_object() {
        return Err(NormalizeError::Shape("data is not an object".into()));
    }

    let close_date = date_at(
        data,
        &[&["closeDate"], &["responseDate"], &["synopsis", "responseDate"]],
    );

    Ok(OpportunityDetail {
        id: id.to_string(),
        number: text_at(data, &[&["number"], &["opportunityNumber"]]),
        title: text_at(data, &[&["title"], &["opportunityTitle"]]),
        agency: text_at(
            data,
            &[&["agency"], &["agencyName"], &["synopsis", "agencyName"]],
        ),
        agency_code: text_at(
            data,
            &[&["agencyCode"], &["owningAgencyCode"], &["synopsis", "agencyCode"]],
        ),
        open_date: date_at(
            data,
            &[&["openDate"], &["postingDate"], &["synopsis", "postingDate"]],
        ),
        close_date,
        is_rolling: close_date.is_none(),
        deadline: OpportunityDetail::deadline_for(close_date),
        award_ceiling: money_at(data, &[&["awardCeiling"], &["synopsis", "awardCeiling"]]),
        award_floor: money_at(data, &[&["awardFloor"], &["synopsis", "awardFloor"]]),
        expected_awards: lookup(
            data,
            &[&["expectedNumOfAwards"], &["synopsis", "numberOfAwards"]],
        )
        .map(parse_count)
        .unwrap_or(0),
        estimated_total_funding: money_at(
            data,
            &[
                &["estimatedFunding"],
                &["estimatedTotalProgramFunding"],
                &["synopsis", "estimatedFunding"],
            ],
        ),
        description: text_at(data, &[&["description"], &["synopsis", "synopsisDesc"]]),
        eligibility: text_at(
            data,
            &[&["eligibility"], &["synopsis", "applicantEligibilityDesc"]],
        ),
        contact: contact_text(data),
        cfda_numbers: cfda_numbers(data),
        funding_category: first_description(
            data,
            &[&["fundingCategory"], &["synopsis", "fundingActivityCategories"]],
        ),
        funding_instrument: first_description(
            data,
            &[&["fundingInstrument"], &["synopsis", "fundingInstruments"]],
        ),
        cost_sharing: lookup(data, &[&["costSharing"], &["synopsis", "costSharing"]])
            .map(parse_flag)
            .unwrap_or(false),
        source_url: format!("{DETAIL_PAGE_BASE}/{id}"),
        last_updated: date_at(
            data,
            &[&["lastUpdatedDate"], &["synopsis", "lastUpdatedDate"]],
        ),
        fetched_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn award_sentinels_become_zero() {
        assert_eq!(parse_money(&JsonValue::Null), 0.0);
        assert_eq!(parse_money(&json!("none")), 0.0);
        assert_eq!(parse_money(&json!("N/A")), 0.0);
        assert_eq!(parse_money(&json!(-50)), 0.0);
        assert_eq!(parse_money(&json!("-1,000")), 0.0);
        assert_eq!(parse_money(&json!("$1,500,000")), 1_500_000.0);
        assert_eq!(parse_money(&json!(250000.5)), 250000.5);
        assert_eq!(parse_count(&json!("12 awards")), 12);
        assert_eq!(parse_count(&json!(null)), 0);
    }

    #[test]
    fn dates_parse_from_every_known_format() {
        let expected = NaiveDate::from_ymd_opt(2026, 4, 13);
        for raw in [
            "04/13/2026",
            "2026-04-13",
            "04-13-2026",
            "Apr 13, 2026",
            "April 13, 2026",
            "04132026",
            "2026-04-13T17:00:00Z",
            "2026-04-13T17:00:00",
            "Apr 13, 2026 12:00:00 AM EDT",
        ] {
            assert_eq!(parse_date(raw), expected, "{raw}");
        }
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("rolling"), None);
        assert_eq!(parse_date("13132026"), None);
    }

    #[test]
    fn contact_scrub_removes_email_phone_and_url_but_keeps_prose() {
        let raw = "Grants Management Specialist Dana Reyes\n\
                   Email: dana.reyes@hhs.gov or call (202) 555-0143 ext. 12\n\
                   See https://www.grants.gov/help for   office hours<br>\n\n\n\
                   Questions answered weekdays";
        let scrubbed = scrub_contact(raw);

        assert!(!scrubbed.contains('@'));
        assert!(!scrubbed.contains("555"));
        assert!(!scrubbed.contains("https"));
        assert!(!scrubbed.contains("grants.gov"));
        for token in ["Grants", "Management", "Specialist", "Dana", "Reyes", "office", "hours", "Questions"] {
            assert!(scrubbed.contains(token), "missing {token} in {scrubbed:?}");
        }
        assert!(!scrubbed.contains("  "));
        assert!(!scrubbed.contains("\n\n"));
    }

    #[test]
    fn contact_scrub_handles_mailto_bare_links_and_fax_labels() {
        assert_eq!(
            scrub_contact("Reach Jo at mailto:jo@nsf.gov or grants.gov/support"),
            "Reach Jo at or"
        );
        assert_eq!(scrub_contact("Phone: 202.555.0143. Fax 202-555-0199"), "");
        assert_eq!(
            scrub_contact("Budget questions go to the program officer. Fax 202-555-0199"),
            "Budget questions go to the program officer."
        );
        assert_eq!(
            scrub_contact("Apply through Grants.gov today."),
            "Apply through Grants.gov today."
        );
    }

    #[test]
    fn contact_boilerplate_phrases_are_dropped() {
        let scrubbed = scrub_contact("For more information, please contact: Program Office");
        assert_eq!(scrubbed, "Program Office");
    }

    #[test]
    fn text_is_stripped_of_nul_and_truncated() {
        assert_eq!(clean_text("a\0b"), "ab");
        let long = "x".repeat(MAX_TEXT_CHARS + 10);
        let cleaned = clean_text(&long);
        assert!(cleaned.ends_with(TRUNCATION_MARKER));
        assert_eq!(cleaned.chars().count(), MAX_TEXT_CHARS + TRUNCATION_MARKER.len());
    }

    #[test]
    fn envelope_with_nonzero_errorcode_is_rejected() {
        let err = envelope_data(&json!({"errorcode": 7, "msg": "bad id"})).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::Upstream {
                code: "7".into(),
                message: "bad id".into()
            }
        );
        assert_eq!(
            envelope_data(&json!({"errorcode": 0})).unwrap_err(),
            NormalizeError::MissingData
        );
    }

    #[test]
    fn nested_synopsis_payload_normalizes() {
        let data = json!({
            "id": 355012,
            "opportunityNumber": "HHS-2026-ACF-0001",
            "opportunityTitle": "Rural Health Outreach",
            "owningAgencyCode": "HHS-ACF",
            "synopsis": {
                "agencyName": "Administration for Children and Families",
                "postingDate": "Jan 05, 2026 12:00:00 AM EST",
                "awardCeiling": "none",
                "awardFloor": "$10,000",
                "numberOfAwards": "4",
                "estimatedFunding": "400000",
                "synopsisDesc": "Supports outreach.",
                "applicantEligibilityDesc": "Nonprofits",
                "agencyContactName": "Dana Reyes",
                "agencyContactEmail": "dana.reyes@hhs.gov",
                "costSharing": false,
                "lastUpdatedDate": "Feb 02, 2026 03:14:00 PM EST",
                "fundingInstruments": [{"id": "G", "description": "Grant"}],
                "fundingActivityCategories": [{"id": "HL", "description": "Health"}]
            },
            "cfdas": [{"cfdaNumber": "93.912"}]
        });
        let fetched_at = Utc::now();
        let detail = detail_from_data("355012", &data, fetched_at).unwrap();

        assert_eq!(detail.number, "HHS-2026-ACF-0001");
        assert_eq!(detail.agency, "Administration for Children and Families");
        assert_eq!(detail.award_ceiling, 0.0);
        assert_eq!(detail.award_floor, 10_000.0);
        assert_eq!(detail.expected_awards, 4);
        assert!(detail.is_rolling);
        assert_eq!(detail.close_date, None);
        assert_eq!(detail.deadline, "");
        assert_eq!(detail.open_date, NaiveDate::from_ymd_opt(2026, 1, 5));
        assert_eq!(detail.last_updated, NaiveDate::from_ymd_opt(2026, 2, 2));
        assert_eq!(detail.contact, "Dana Reyes");
        assert_eq!(detail.cfda_numbers, vec!["93.912".to_string()]);
        assert_eq!(detail.funding_instrument, "Grant");
        assert_eq!(detail.funding_category, "Health");
        assert_eq!(detail.source_url, format!("{DETAIL_PAGE_BASE}/355012"));
    }

    #[test]
    fn flat_payload_with_close_date_is_not_rolling() {
        let data = json!({
            "title": "Clean Water\u{0000} Grants",
            "agency": "EPA",
            "closeDate": "09/30/2026",
            "awardCeiling": 750000,
            "cfda": "66.458, 66.468",
            "costSharing": "Yes"
        });
        let detail = detail_from_data("88", &data, Utc::now()).unwrap();
        assert_eq!(detail.title, "Clean Water Grants");
        assert!(!detail.is_rolling);
        assert_eq!(detail.deadline, "2026-09-30");
        assert_eq!(detail.award_ceiling, 750_000.0);
        assert_eq!(detail.cfda_numbers, vec!["66.458", "66.468"]);
        assert!(detail.cost_sharing);
    }
}
