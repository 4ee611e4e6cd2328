//! Field normalizer: total, pure conversions from scraped strings to the
//! canonical values stored in the sheet. Nothing in here returns an error;
//! input that cannot be interpreted is passed through or blanked.

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Column, FriendFlag, ProfileRecord, ProfileStatus, RawProfile};

/// The site reports times in UTC+5 with no daylight adjustment.
pub const SITE_UTC_OFFSET_SECS: i32 = 5 * 3600;
pub const DATE_FORMAT: &str = "%d-%b-%y";
pub const TIMESTAMP_FORMAT: &str = "%d-%b-%y %I:%M %p";

const PLACEHOLDERS: &[&str] = &[
    "no city",
    "not set",
    "no set",
    "n/a",
    "[no posts]",
    "[no post url]",
    "[error]",
    "none",
    "null",
    "no age",
];

const GENDER_MALE: &str = "🕺";
const GENDER_FEMALE: &str = "💃";
const MARRIED: &str = "💍";
const NOT_MARRIED: &str = "❎";

static UNIT_SYNONYMS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\bsecs?\b", "seconds"),
        (r"\bmins?\b", "minutes"),
        (r"\bhrs?\b", "hours"),
        (r"\bwks?\b", "weeks"),
        (r"\byrs?\b", "years"),
        (r"\bmons?\b", "months"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).expect("static unit pattern"), replacement))
    .collect()
});

static ARTICLE_AGO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:a|an)\s+(second|minute|hour|day|week|month|year)s?\s*ago\b")
        .expect("static article pattern")
});

static COUNT_AGO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s*(second|minute|hour|day|week|month|year)s?\s*ago")
        .expect("static count pattern")
});

static FIRST_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+").expect("static number pattern"));

pub fn site_offset() -> FixedOffset {
    FixedOffset::east_opt(SITE_UTC_OFFSET_SECS).expect("UTC+5 is a valid offset")
}

pub fn site_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&site_offset())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Url,
    RelativeDate,
    Gender,
    Marital,
    Count,
}

/// Normalizer pinned to one "now", so a whole record is converted against
/// the same reference instant.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    now: DateTime<FixedOffset>,
}

impl Normalizer {
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self {
            now: now.with_timezone(&site_offset()),
        }
    }

    pub fn at_site_now() -> Self {
        Self::new(site_now())
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        self.now
    }

    pub fn normalize(&self, raw: &str, kind: FieldKind) -> String {
        let value = strip_placeholder(&collapse_whitespace(raw));
        if value.is_empty() {
            return value;
        }
        match kind {
            FieldKind::Text | FieldKind::Url => value,
            FieldKind::RelativeDate => relative_date(&value, self.now),
            FieldKind::Gender => gender_symbol(&value),
            FieldKind::Marital => marital_symbol(&value),
            FieldKind::Count => first_number(&value),
        }
    }

    /// Canonicalize a scraped record. Tags are attached later by the reconciler.
    pub fn profile(&self, raw: &RawProfile, source: &str) -> ProfileRecord {
        let field = |column: Column| self.normalize(raw.get(column), column.kind());
        ProfileRecord {
            nickname: collapse_whitespace(&raw.nickname),
            image_url: field(Column::Image),
            tags: String::new(),
            last_post_url: field(Column::LastPost),
            last_post_time: field(Column::LastPostTime),
            friend: FriendFlag::parse(&field(Column::Friend)),
            city: field(Column::City),
            gender: field(Column::Gender),
            married: field(Column::Married),
            age: field(Column::Age),
            joined: field(Column::Joined),
            followers: field(Column::Followers),
            status: ProfileStatus::parse(&field(Column::Status)),
            posts: field(Column::Posts),
            profile_url: field(Column::ProfileLink),
            intro: field(Column::Intro),
            source: collapse_whitespace(source),
            scraped_at: raw
                .fetched_at
                .with_timezone(&site_offset())
                .format(TIMESTAMP_FORMAT)
                .to_string(),
        }
    }
}

/// Collapse every whitespace run (non-breaking spaces and newlines included)
/// to one space and trim both ends.
pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn strip_placeholder(value: &str) -> String {
    let trimmed = value.trim();
    let lower = trimmed.to_lowercase();
    if PLACEHOLDERS.contains(&lower.as_str()) {
        String::new()
    } else {
        trimmed.to_string()
    }
}

/// Convert "3 hours ago" style text to a `dd-Mon-yy` date relative to `now`.
/// Unrecognized text comes back unchanged.
pub fn relative_date(raw: &str, now: DateTime<FixedOffset>) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }

    let mut text = raw.trim().to_lowercase();
    for (pattern, replacement) in UNIT_SYNONYMS.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }

    if text == "just now" || text == "now" {
        return now.format(DATE_FORMAT).to_string();
    }
    if text == "yesterday" {
        return shifted(now, TimeDelta::try_days(1)).unwrap_or_else(|| raw.to_string());
    }

    let parsed = if let Some(caps) = ARTICLE_AGO.captures(&text) {
        Some((1i64, caps[1].to_string()))
    } else {
        COUNT_AGO
            .captures(&text)
            .and_then(|caps| caps[1].parse::<i64>().ok().map(|n| (n, caps[2].to_string())))
    };
    let Some((amount, unit)) = parsed else {
        return raw.to_string();
    };

    let delta = match unit.as_str() {
        "second" => TimeDelta::try_seconds(amount),
        "minute" => TimeDelta::try_minutes(amount),
        "hour" => TimeDelta::try_hours(amount),
        "day" => TimeDelta::try_days(amount),
        "week" => TimeDelta::try_weeks(amount),
        "month" => amount.checked_mul(30).and_then(TimeDelta::try_days),
        "year" => amount.checked_mul(365).and_then(TimeDelta::try_days),
        _ => None,
    };
    shifted(now, delta).unwrap_or_else(|| raw.to_string())
}

fn shifted(now: DateTime<FixedOffset>, delta: Option<TimeDelta>) -> Option<String> {
    now.checked_sub_signed(delta?)
        .map(|at| at.format(DATE_FORMAT).to_string())
}

pub fn gender_symbol(value: &str) -> String {
    match value.trim().to_lowercase().as_str() {
        "male" => GENDER_MALE.to_string(),
        "female" => GENDER_FEMALE.to_string(),
        _ => value.to_string(),
    }
}

pub fn marital_symbol(value: &str) -> String {
    match value.trim().to_lowercase().as_str() {
        "yes" | "married" => MARRIED.to_string(),
        "no" | "single" | "unmarried" => NOT_MARRIED.to_string(),
        _ => value.to_string(),
    }
}

/// First run of digits, or empty when the text has none.
pub fn first_number(value: &str) -> String {
    FIRST_NUMBER
        .find(value)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}
