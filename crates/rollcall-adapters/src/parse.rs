//! Pure extraction over fetched site pages.
//!
//! Each field is read through an ordered list of [`Extract`] strategies; the
//! first strategy that yields an acceptable non-empty value wins and a field
//! with no successful strategy is left empty. Nothing here performs I/O, so
//! the whole module is exercised against captured pages under `fixtures/site`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rollcall_core::normalize::first_number;
use rollcall_core::{collapse_whitespace, fold_identifier, Column, FriendFlag, ProfileStatus, RawProfile};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

/// Present on every fully rendered profile page.
pub const READY_MARKER: &str = "h1.cxl.clb.lsp";

const ONLINE_ITEM: &str = "li.mbl.cl.sp";
const ONLINE_LINK: &str = "a[href*='/users/']";
const RECENT_POST: &str = "article.mbl";

static TEXT_POST_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/comments/text/(\d+)/").expect("valid text post regex"));
static IMAGE_POST_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/comments/image/(\d+)/").expect("valid image post regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extract {
    /// Collapsed text of the first element matching the selector.
    Text(&'static str),
    /// Attribute of the first element matching the selector.
    Attr {
        selector: &'static str,
        attr: &'static str,
    },
    /// Text of the first `span` sibling after a `b` whose text contains the label.
    LabeledSpan(&'static str),
}

impl Extract {
    pub fn run(&self, scope: ElementRef<'_>) -> Option<String> {
        match *self {
            Extract::Text(selector) => {
                let selector = Selector::parse(selector).ok()?;
                scope.select(&selector).next().and_then(element_text)
            }
            Extract::Attr { selector, attr } => {
                let selector = Selector::parse(selector).ok()?;
                let value = scope.select(&selector).next()?.value().attr(attr)?.trim();
                (!value.is_empty()).then(|| value.to_string())
            }
            Extract::LabeledSpan(label) => {
                let bold = Selector::parse("b").ok()?;
                let label_node = scope
                    .select(&bold)
                    .find(|b| b.text().collect::<String>().contains(label))?;
                label_node
                    .next_siblings()
                    .filter_map(ElementRef::wrap)
                    .find(|sibling| sibling.value().name() == "span")
                    .and_then(element_text)
            }
        }
    }
}

/// Run `strategies` in order and return the first value `accept` keeps.
pub fn first_match<F>(scope: ElementRef<'_>, strategies: &[Extract], accept: F) -> Option<String>
where
    F: Fn(String) -> Option<String>,
{
    strategies
        .iter()
        .find_map(|strategy| strategy.run(scope).and_then(&accept))
}

const INTRO: &[Extract] = &[
    Extract::Text("span.cl.sp.lsp.nos"),
    Extract::Text("span.cl"),
    Extract::Text(".ow span.nos"),
];

const FOLLOWERS: &[Extract] = &[Extract::Text("span.cl.sp.clb"), Extract::Text(".cl.sp.clb")];

const POSTS: &[Extract] = &[
    Extract::Text("a[href*='/profile/public/'] button div:first-child"),
    Extract::Text("a[href*='/profile/public/'] button div"),
];

const AVATAR: &[Extract] = &[
    Extract::Attr {
        selector: "img[src*='avatar-imgs']",
        attr: "src",
    },
    Extract::Attr {
        selector: "img[src*='avatar']",
        attr: "src",
    },
    Extract::Attr {
        selector: "div[style*='whitesmoke'] img[src*='cloudfront.net']",
        attr: "src",
    },
];

const LABELED: [(Column, &str); 5] = [
    (Column::City, "City:"),
    (Column::Gender, "Gender:"),
    (Column::Married, "Married:"),
    (Column::Age, "Age:"),
    (Column::Joined, "Joined:"),
];

const POST_TIME: &[Extract] = &[
    Extract::Text("span[itemprop='datePublished']"),
    Extract::Text("time[itemprop='datePublished']"),
    Extract::Text("span.cxs.cgy"),
    Extract::Text("time"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostLink {
    Content,
    TextComment,
    ImageComment,
}

const POST_LINKS: [(Extract, PostLink); 3] = [
    (
        Extract::Attr {
            selector: "a[href*='/content/']",
            attr: "href",
        },
        PostLink::Content,
    ),
    (
        Extract::Attr {
            selector: "a[href*='/comments/text/']",
            attr: "href",
        },
        PostLink::TextComment,
    ),
    (
        Extract::Attr {
            selector: "a[href*='/comments/image/']",
            attr: "href",
        },
        PostLink::ImageComment,
    ),
];

fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = collapse_whitespace(&element.text().collect::<String>());
    (!text.is_empty()).then_some(text)
}

fn has_match(document: &Html, selector: &str) -> bool {
    Selector::parse(selector)
        .map(|selector| document.select(&selector).next().is_some())
        .unwrap_or(false)
}

/// Digits of a count like "1,204 followers"; thousands separators are ignored.
fn count_digits(text: String) -> Option<String> {
    let digits = first_number(&text.replace(',', ""));
    (!digits.is_empty()).then_some(digits)
}

fn non_empty(text: String) -> Option<String> {
    (!text.trim().is_empty()).then_some(text)
}

/// Site-relative or scheme-relative links resolved against `base`.
pub fn absolute_url(base: &str, href: &str) -> String {
    let href = href.trim();
    let base = base.trim_end_matches('/');
    if href.is_empty() {
        String::new()
    } else if let Some(rest) = href.strip_prefix("//") {
        format!("https://{rest}")
    } else if href.starts_with('/') {
        format!("{base}{href}")
    } else if href.starts_with("http") {
        href.to_string()
    } else {
        format!("{base}/{href}")
    }
}

pub fn profile_url(base: &str, nickname: &str) -> String {
    format!("{}/users/{}/", base.trim_end_matches('/'), nickname)
}

pub fn public_posts_url(base: &str, nickname: &str) -> String {
    format!("{}/profile/public/{}", base.trim_end_matches('/'), nickname)
}

pub fn online_list_url(base: &str) -> String {
    format!("{}/online_kon/", base.trim_end_matches('/'))
}

/// Nicknames are at least three characters, contain a letter and are not
/// purely numeric.
pub fn is_identifier_token(token: &str) -> bool {
    let token = token.trim();
    token.chars().count() >= 3
        && !token.chars().all(|c| c.is_ascii_digit())
        && token.chars().any(char::is_alphabetic)
}

/// Online nicknames in page order, without duplicates (case-insensitive).
/// Falls back to profile links when the list markup is absent.
pub fn parse_online_list(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut names = OnlineNames::default();

    if let (Ok(item), Ok(bold)) = (Selector::parse(ONLINE_ITEM), Selector::parse("b")) {
        for li in document.select(&item) {
            if let Some(name) = li.select(&bold).next().and_then(element_text) {
                names.keep(&name);
            }
        }
    }

    if names.ordered.is_empty() {
        if let Ok(link) = Selector::parse(ONLINE_LINK) {
            for anchor in document.select(&link) {
                let Some(href) = anchor.value().attr("href") else {
                    continue;
                };
                if let Some(name) = nickname_from_href(href) {
                    names.keep(name);
                }
            }
        }
    }
    names.ordered
}

#[derive(Default)]
struct OnlineNames {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl OnlineNames {
    fn keep(&mut self, candidate: &str) {
        let candidate = candidate.trim();
        if is_identifier_token(candidate) && self.seen.insert(fold_identifier(candidate)) {
            self.ordered.push(candidate.to_string());
        }
    }
}

fn nickname_from_href(href: &str) -> Option<&str> {
    let (_, rest) = href.rsplit_once("/users/")?;
    rest.split('/').next().filter(|name| !name.is_empty())
}

pub fn is_profile_ready(document: &Html) -> bool {
    has_match(document, READY_MARKER)
}

pub fn profile_status(html: &str, document: &Html) -> ProfileStatus {
    let lower = html.to_lowercase();
    if lower.contains("account suspended") {
        ProfileStatus::Suspended
    } else if lower.contains("background:tomato") || has_match(document, "div[style*='tomato']") {
        ProfileStatus::Unverified
    } else {
        ProfileStatus::Verified
    }
}

pub fn friend_flag(html: &str) -> FriendFlag {
    let lower = html.to_lowercase();
    if lower.contains("action=\"/follow/remove/\"") || lower.contains("unfollow.svg") {
        FriendFlag::Yes
    } else if lower.contains("follow.svg") && !lower.contains("unfollow") {
        FriendFlag::No
    } else {
        FriendFlag::Unknown
    }
}

/// Raw profile fields from a profile page, or `None` when the page never
/// finished rendering. Values stay un-normalized apart from whitespace.
pub fn parse_profile_page(
    html: &str,
    nickname: &str,
    base: &str,
    fetched_at: DateTime<Utc>,
) -> Option<RawProfile> {
    let document = Html::parse_document(html);
    if !is_profile_ready(&document) {
        return None;
    }
    let root = document.root_element();
    let mut raw = RawProfile::new(nickname, fetched_at)
        .with(Column::NickName, nickname)
        .with(Column::ProfileLink, profile_url(base, nickname))
        .with(Column::Status, profile_status(html, &document).as_str())
        .with(Column::Friend, friend_flag(html).as_str());

    if let Some(intro) = first_match(root, INTRO, non_empty) {
        raw.set(Column::Intro, intro);
    }
    for (column, label) in LABELED {
        if let Some(value) = Extract::LabeledSpan(label).run(root) {
            raw.set(column, value);
        }
    }
    if let Some(followers) = first_match(root, FOLLOWERS, count_digits) {
        raw.set(Column::Followers, followers);
    }
    if let Some(posts) = first_match(root, POSTS, count_digits) {
        raw.set(Column::Posts, posts);
    }
    let avatar = first_match(root, AVATAR, |src| {
        (src.contains("avatar") || src.contains("cloudfront.net")).then(|| src.replace("/thumbnail/", "/"))
    });
    if let Some(src) = avatar {
        raw.set(Column::Image, absolute_url(base, &src));
    }
    Some(raw)
}

/// True when the profile advertises at least one post.
pub fn has_posts(raw: &RawProfile) -> bool {
    raw.get(Column::Posts)
        .parse::<u64>()
        .map(|count| count > 0)
        .unwrap_or(false)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentPost {
    pub url: String,
    pub posted: String,
}

impl RecentPost {
    pub fn apply(self, raw: &mut RawProfile) {
        if !self.url.is_empty() {
            raw.set(Column::LastPost, self.url);
        }
        if !self.posted.is_empty() {
            raw.set(Column::LastPostTime, self.posted);
        }
    }
}

/// Newest post on a public posts page. Missing pieces come back empty.
pub fn parse_recent_post(html: &str, base: &str) -> RecentPost {
    let document = Html::parse_document(html);
    let Ok(article) = Selector::parse(RECENT_POST) else {
        return RecentPost::default();
    };
    let Some(recent) = document.select(&article).next() else {
        return RecentPost::default();
    };

    let url = POST_LINKS
        .iter()
        .find_map(|(strategy, kind)| strategy.run(recent).map(|href| post_link(base, &href, *kind)))
        .unwrap_or_default();
    let posted = first_match(recent, POST_TIME, non_empty).unwrap_or_default();
    RecentPost { url, posted }
}

fn post_link(base: &str, href: &str, kind: PostLink) -> String {
    match kind {
        PostLink::Content => absolute_url(base, href),
        PostLink::TextComment => match TEXT_POST_ID.captures(href) {
            Some(id) => absolute_url(base, &format!("/comments/text/{}", &id[1])),
            None => absolute_url(base, href),
        },
        PostLink::ImageComment => match IMAGE_POST_ID.captures(href) {
            Some(id) => absolute_url(base, &format!("/content/{}/g/", &id[1])),
            None => absolute_url(base, href),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    const BASE: &str = "https://damadam.pk";

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(name: &str) -> String {
        let path = workspace_root().join("fixtures").join("site").join(name);
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn profile(name: &str, nickname: &str) -> RawProfile {
        parse_profile_page(&fixture(name), nickname, BASE, Utc::now()).expect("page ready")
    }

    #[test]
    fn online_list_filters_and_dedupes_in_page_order() {
        let names = parse_online_list(&fixture("online_kon.html"));
        assert_eq!(names, vec!["Sana_Khan", "ali786", "Rida.Malik"]);
    }

    #[test]
    fn online_list_falls_back_to_profile_links() {
        let names = parse_online_list(&fixture("online_links_only.html"));
        assert_eq!(names, vec!["Hamza_01", "Noor"]);
    }

    #[test]
    fn identifier_tokens_need_three_chars_and_a_letter() {
        assert!(is_identifier_token("abc"));
        assert!(is_identifier_token("user_42"));
        assert!(!is_identifier_token("ab"));
        assert!(!is_identifier_token("12345"));
        assert!(!is_identifier_token("_-_"));
    }

    #[test]
    fn verified_profile_fields_are_extracted() {
        let raw = profile("profile_verified.html", "Sana_Khan");
        assert_eq!(raw.get(Column::Status), "Verified");
        assert_eq!(raw.get(Column::Friend), "Yes");
        assert_eq!(raw.get(Column::Intro), "Coffee, books & rain");
        assert_eq!(raw.get(Column::City), "Karachi");
        assert_eq!(raw.get(Column::Gender), "Female");
        assert_eq!(raw.get(Column::Married), "No");
        assert_eq!(raw.get(Column::Age), "24");
        assert_eq!(raw.get(Column::Joined), "2 years ago");
        assert_eq!(raw.get(Column::Followers), "1204");
        assert_eq!(raw.get(Column::Posts), "37");
        assert_eq!(
            raw.get(Column::Image),
            "https://cdn.example.cloudfront.net/avatar-imgs/sana.jpg"
        );
        assert_eq!(raw.get(Column::ProfileLink), "https://damadam.pk/users/Sana_Khan/");
        assert!(has_posts(&raw));
    }

    #[test]
    fn unverified_profile_keeps_placeholders_for_the_normalizer() {
        let raw = profile("profile_unverified.html", "ali786");
        assert_eq!(raw.get(Column::Status), "Unverified");
        assert_eq!(raw.get(Column::Friend), "No");
        assert_eq!(raw.get(Column::City), "No city");
        assert_eq!(raw.get(Column::Intro), "");
        assert_eq!(
            raw.get(Column::Image),
            "https://damadam.pk/static/img/avatar-default.png"
        );
        assert!(!has_posts(&raw));
    }

    #[test]
    fn suspended_marker_wins_over_other_status_signals() {
        let raw = profile("profile_suspended.html", "Rida.Malik");
        assert_eq!(raw.get(Column::Status), "Suspended");
        assert_eq!(raw.get(Column::Friend), "");
    }

    #[test]
    fn page_without_ready_marker_is_rejected() {
        assert!(parse_profile_page(&fixture("profile_not_ready.html"), "x", BASE, Utc::now()).is_none());
    }

    #[test]
    fn recent_text_post_link_is_canonicalized() {
        let post = parse_recent_post(&fixture("public_posts.html"), BASE);
        assert_eq!(post.url, "https://damadam.pk/comments/text/88123");
        assert_eq!(post.posted, "3 hours ago");
    }

    #[test]
    fn recent_image_post_points_at_content_page() {
        let post = parse_recent_post(&fixture("public_posts_image.html"), BASE);
        assert_eq!(post.url, "https://damadam.pk/content/55501/g/");
        assert_eq!(post.posted, "yesterday");
    }

    #[test]
    fn recent_post_is_empty_without_articles() {
        assert_eq!(parse_recent_post("<html><body></body></html>", BASE), RecentPost::default());
    }

    #[test]
    fn urls_are_made_absolute() {
        assert_eq!(absolute_url(BASE, "/users/a/"), "https://damadam.pk/users/a/");
        assert_eq!(absolute_url(BASE, "users/a/"), "https://damadam.pk/users/a/");
        assert_eq!(absolute_url(BASE, "//cdn.x/y.jpg"), "https://cdn.x/y.jpg");
        assert_eq!(absolute_url(BASE, "https://other/"), "https://other/");
        assert_eq!(absolute_url(BASE, "  "), "");
    }
}
