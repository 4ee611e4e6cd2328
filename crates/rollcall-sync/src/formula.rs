//! Presentation formulas for the link columns, and recovery of the URL from
//! a formula cell read back with formula rendering.

use once_cell::sync::Lazy;
use regex::Regex;
use rollcall_core::Column;

static HYPERLINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^=\s*HYPERLINK\(\s*"((?:[^"]|"")*)"\s*(?:[,;]\s*"((?:[^"]|"")*)"\s*)?\)\s*$"#)
        .expect("valid hyperlink regex")
});
static IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^=\s*IMAGE\(\s*"((?:[^"]|"")*)"[^)]*\)\s*$"#).expect("valid image regex")
});

fn escape(value: &str) -> String {
    value.replace('"', "\"\"")
}

fn unescape(value: &str) -> String {
    value.replace("\"\"", "\"")
}

/// Formula written into a link column, or `None` for other columns and blank URLs.
pub fn link_formula(column: Column, url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    match column {
        Column::Image => Some(format!("=IMAGE(\"{}\", 4, 50, 50)", escape(url))),
        Column::LastPost | Column::ProfileLink => Some(format!(
            "=HYPERLINK(\"{}\", \"{}\")",
            escape(url),
            column.link_label()
        )),
        _ => None,
    }
}

/// A stored link-column cell split into what the sheet displays and the URL
/// behind it, when that URL is recoverable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCell {
    pub label: String,
    pub url: Option<String>,
}

pub fn decode_link_cell(cell: &str) -> LinkCell {
    let trimmed = cell.trim();
    if let Some(caps) = HYPERLINK.captures(trimmed) {
        let url = unescape(&caps[1]);
        let label = caps
            .get(2)
            .map(|m| unescape(m.as_str()))
            .unwrap_or_else(|| url.clone());
        return LinkCell {
            label,
            url: Some(url),
        };
    }
    if let Some(caps) = IMAGE.captures(trimmed) {
        return LinkCell {
            label: String::new(),
            url: Some(unescape(&caps[1])),
        };
    }
    LinkCell {
        label: trimmed.to_string(),
        url: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formulas_match_the_sheet_conventions() {
        assert_eq!(
            link_formula(Column::Image, "https://cdn/x.jpg").as_deref(),
            Some("=IMAGE(\"https://cdn/x.jpg\", 4, 50, 50)")
        );
        assert_eq!(
            link_formula(Column::LastPost, "https://site/p/1").as_deref(),
            Some("=HYPERLINK(\"https://site/p/1\", \"Post\")")
        );
        assert_eq!(
            link_formula(Column::ProfileLink, "https://site/users/a/").as_deref(),
            Some("=HYPERLINK(\"https://site/users/a/\", \"Profile\")")
        );
        assert_eq!(link_formula(Column::City, "https://x"), None);
        assert_eq!(link_formula(Column::LastPost, "  "), None);
    }

    #[test]
    fn quotes_survive_a_write_read_cycle() {
        let formula = link_formula(Column::ProfileLink, "https://site/?q=\"a\"").unwrap();
        assert_eq!(formula, "=HYPERLINK(\"https://site/?q=\"\"a\"\"\", \"Profile\")");
        let cell = decode_link_cell(&formula);
        assert_eq!(cell.url.as_deref(), Some("https://site/?q=\"a\""));
        assert_eq!(cell.label, "Profile");
    }

    #[test]
    fn stored_cells_decode_to_label_and_url() {
        assert_eq!(
            decode_link_cell("=IMAGE(\"https://cdn/y.png\", 4, 50, 50)"),
            LinkCell {
                label: String::new(),
                url: Some("https://cdn/y.png".to_string()),
            }
        );
        assert_eq!(
            decode_link_cell("=hyperlink(\"https://site/p/9\";\"Post\")").url.as_deref(),
            Some("https://site/p/9")
        );
        assert_eq!(
            decode_link_cell("Post"),
            LinkCell {
                label: "Post".to_string(),
                url: None,
            }
        );
    }
}
