//! Core domain model for the roll-call pipeline: the profile sheet layout,
//! scraped/normalized profile records, and the append-only log rows.

pub mod normalize;

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

pub use normalize::{
    collapse_whitespace, site_now, site_offset, strip_placeholder, FieldKind, Normalizer,
    DATE_FORMAT, TIMESTAMP_FORMAT,
};

pub const CRATE_NAME: &str = "rollcall-core";

/// Columns of the `Profiles` sheet, in persisted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Column {
    Image,
    NickName,
    Tags,
    LastPost,
    LastPostTime,
    Friend,
    City,
    Gender,
    Married,
    Age,
    Joined,
    Followers,
    Status,
    Posts,
    ProfileLink,
    Intro,
    Source,
    DatetimeScrap,
}

impl Column {
    pub const ALL: [Column; 18] = [
        Column::Image,
        Column::NickName,
        Column::Tags,
        Column::LastPost,
        Column::LastPostTime,
        Column::Friend,
        Column::City,
        Column::Gender,
        Column::Married,
        Column::Age,
        Column::Joined,
        Column::Followers,
        Column::Status,
        Column::Posts,
        Column::ProfileLink,
        Column::Intro,
        Column::Source,
        Column::DatetimeScrap,
    ];

    /// Columns whose cell carries a presentation formula pointing at a URL.
    pub const LINKS: [Column; 3] = [Column::Image, Column::LastPost, Column::ProfileLink];

    pub fn header(self) -> &'static str {
        match self {
            Column::Image => "IMAGE",
            Column::NickName => "NICK NAME",
            Column::Tags => "TAGS",
            Column::LastPost => "LAST POST",
            Column::LastPostTime => "LAST POST TIME",
            Column::Friend => "FRIEND",
            Column::City => "CITY",
            Column::Gender => "GENDER",
            Column::Married => "MARRIED",
            Column::Age => "AGE",
            Column::Joined => "JOINED",
            Column::Followers => "FOLLOWERS",
            Column::Status => "STATUS",
            Column::Posts => "POSTS",
            Column::ProfileLink => "PROFILE LINK",
            Column::Intro => "INTRO",
            Column::Source => "SOURCE",
            Column::DatetimeScrap => "DATETIME SCRAP",
        }
    }

    /// Zero-based offset of the column within a row.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_header(header: &str) -> Option<Column> {
        let header = header.trim();
        Column::ALL
            .into_iter()
            .find(|c| c.header().eq_ignore_ascii_case(header))
    }

    pub fn kind(self) -> FieldKind {
        match self {
            Column::Image | Column::LastPost | Column::ProfileLink => FieldKind::Url,
            Column::LastPostTime | Column::Joined => FieldKind::RelativeDate,
            Column::Gender => FieldKind::Gender,
            Column::Married => FieldKind::Marital,
            Column::Followers | Column::Posts => FieldKind::Count,
            _ => FieldKind::Text,
        }
    }

    pub fn is_link(self) -> bool {
        Column::LINKS.contains(&self)
    }

    /// Display text stored in the main row for a populated link column.
    /// The image cell shows the rendered thumbnail, so its label is empty.
    pub fn link_label(self) -> &'static str {
        match self {
            Column::LastPost => "Post",
            Column::ProfileLink => "Profile",
            _ => "",
        }
    }
}

pub fn profile_header() -> Vec<String> {
    Column::ALL.iter().map(|c| c.header().to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProfileStatus {
    Verified,
    Unverified,
    Suspended,
    #[default]
    Unknown,
}

impl ProfileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProfileStatus::Verified => "Verified",
            ProfileStatus::Unverified => "Unverified",
            ProfileStatus::Suspended => "Suspended",
            ProfileStatus::Unknown => "",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "verified" => ProfileStatus::Verified,
            "unverified" => ProfileStatus::Unverified,
            "suspended" => ProfileStatus::Suspended,
            _ => ProfileStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FriendFlag {
    Yes,
    No,
    #[default]
    Unknown,
}

impl FriendFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            FriendFlag::Yes => "Yes",
            FriendFlag::No => "No",
            FriendFlag::Unknown => "",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "yes" => FriendFlag::Yes,
            "no" => FriendFlag::No,
            _ => FriendFlag::Unknown,
        }
    }
}

/// Handoff contract from the scrape collaborator: raw, un-normalized strings
/// per column. Columns the scraper could not find are simply absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProfile {
    pub nickname: String,
    pub fetched_at: DateTime<Utc>,
    pub fields: BTreeMap<Column, String>,
}

impl RawProfile {
    pub fn new(nickname: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            nickname: nickname.into(),
            fetched_at,
            fields: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, column: Column, value: impl Into<String>) {
        self.fields.insert(column, value.into());
    }

    pub fn with(mut self, column: Column, value: impl Into<String>) -> Self {
        self.set(column, value);
        self
    }

    pub fn get(&self, column: Column) -> &str {
        self.fields.get(&column).map(String::as_str).unwrap_or_default()
    }
}

/// Canonical profile row. Every text field is already normalized.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub nickname: String,
    pub image_url: String,
    pub tags: String,
    pub last_post_url: String,
    pub last_post_time: String,
    pub friend: FriendFlag,
    pub city: String,
    pub gender: String,
    pub married: String,
    pub age: String,
    pub joined: String,
    pub followers: String,
    pub status: ProfileStatus,
    pub posts: String,
    pub profile_url: String,
    pub intro: String,
    pub source: String,
    pub scraped_at: String,
}

impl ProfileRecord {
    pub fn value(&self, column: Column) -> &str {
        match column {
            Column::Image => &self.image_url,
            Column::NickName => &self.nickname,
            Column::Tags => &self.tags,
            Column::LastPost => &self.last_post_url,
            Column::LastPostTime => &self.last_post_time,
            Column::Friend => self.friend.as_str(),
            Column::City => &self.city,
            Column::Gender => &self.gender,
            Column::Married => &self.married,
            Column::Age => &self.age,
            Column::Joined => &self.joined,
            Column::Followers => &self.followers,
            Column::Status => self.status.as_str(),
            Column::Posts => &self.posts,
            Column::ProfileLink => &self.profile_url,
            Column::Intro => &self.intro,
            Column::Source => &self.source,
            Column::DatetimeScrap => &self.scraped_at,
        }
    }

    /// Case-folded identity key.
    pub fn identity(&self) -> String {
        fold_identifier(&self.nickname)
    }
}

pub fn fold_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

pub const ONLINE_STATUS: &str = "Online";
pub const ONLINE_LOG_HEADER: [&str; 3] = ["Nickname", "Status", "Timestamp"];

/// One "observed online" occurrence. Appended, never deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineEvent {
    pub nickname: String,
    pub observed_at: DateTime<FixedOffset>,
}

impl OnlineEvent {
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.nickname.clone(),
            ONLINE_STATUS.to_string(),
            self.observed_at.format(TIMESTAMP_FORMAT).to_string(),
        ]
    }
}

pub const DASHBOARD_HEADER: [&str; 8] = [
    "Run#", "Timestamp", "Profiles", "Success", "Failed", "New", "Updated", "Source",
];

/// One dashboard row. `targeted` is what discovery handed the run and fills
/// the `Profiles` cell; `seen` is how many of those were fully processed, so
/// the two only differ when a run stops early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_no: u32,
    pub recorded_at: DateTime<FixedOffset>,
    pub targeted: usize,
    pub seen: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub source: String,
}

impl RunSummary {
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.run_no.to_string(),
            self.recorded_at.format(TIMESTAMP_FORMAT).to_string(),
            self.targeted.to_string(),
            self.succeeded.to_string(),
            self.failed.to_string(),
            self.new.to_string(),
            self.updated.to_string(),
            self.source.clone(),
        ]
    }
}
