//! Course detail page parsing.

use std::sync::LazyLock;

use courselink_core::CourseDetails;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::AdapterError;

static HOURS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([\d–-]+\s+hours?(\s*\([^)]+\))?)").expect("hours pattern compiles")
});
static HOURS_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\d–-]+").expect("hours value pattern compiles"));
static PAREN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]+\)").expect("paren pattern compiles"));
static PREREQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Prerequisite\(s\):").expect("prereq pattern compiles"));
static FEES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Course specific fees").expect("fees pattern compiles"));
static FEES_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)Course specific fees.*?:\s*").expect("fees label pattern compiles"));
static PREREQ_STOP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Course specific fees|May be repeated|May only be taken|Not offered every term")
        .expect("stop pattern compiles")
});

/// Collapse whitespace runs and tidy the space a `<br>` leaves before a comma.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").replace(" ,", ",")
}

/// Parse a catalog course preview page into its detail fields.
///
/// The body text is the element enclosing `h1#course_preview_title`. The
/// source markup nests the title in a `<p>`, which html5ever closes early, so
/// the enclosing element is whatever the title ends up attached to. A page
/// without the title yields empty details rather than an error.
pub fn parse_course_detail_html(html: &str) -> Result<CourseDetails, AdapterError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("h1#course_preview_title")
        .map_err(|e| AdapterError::Message(e.to_string()))?;

    let Some(title) = document.select(&selector).next() else {
        return Ok(CourseDetails::default());
    };
    let Some(parent) = title.parent().and_then(ElementRef::wrap) else {
        return Ok(CourseDetails::default());
    };

    let title_text: String = title.text().map(str::trim).collect();
    let body = parent.text().collect::<Vec<_>>().join(" ");
    let data_text = clean_text(&body.replacen(&title_text, "", 1));
    Ok(split_detail_text(&data_text))
}

fn split_detail_text(original: &str) -> CourseDetails {
    let mut details = CourseDetails::default();
    let mut fragments: Vec<String> = Vec::new();
    let mut data_text = original.to_string();

    if let Some(hours_match) = HOURS_RE.captures(&data_text) {
        let block = hours_match[0].to_string();
        details.hours = HOURS_VALUE_RE
            .find(&block)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        if let Some(specific) = PAREN_RE.find(&block) {
            details.specific_hours = specific.as_str().to_string();
        }
        data_text = data_text[block.len()..].trim().to_string();
        fragments.push(block);
    }

    let prereq_at = PREREQ_RE.find(&data_text).map(|m| (m.start(), m.end()));
    let fees_at = FEES_RE.find(&data_text).map(|m| m.start());

    let first_marker = [prereq_at.map(|(start, _)| start), fees_at]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(data_text.len());
    let description = data_text[..first_marker].trim();
    if !description.is_empty() {
        details.description = description.to_string();
        fragments.push(description.to_string());
    }

    if let Some((start, label_end)) = prereq_at {
        let stop = PREREQ_STOP_RE
            .find(&data_text[label_end..])
            .map(|m| label_end + m.start())
            .unwrap_or(data_text.len());
        let block = data_text[start..stop].trim().to_string();
        let content = PREREQ_RE.replace_all(&block, "").trim().to_string();
        if !matches!(content.to_lowercase().as_str(), "none" | "none.") {
            details.prerequisites = content;
        }
        fragments.push(block);
    }

    if let Some(start) = fees_at {
        let block = data_text[start..].trim().to_string();
        details.course_fees = FEES_LABEL_RE.replace(&block, "").trim().to_string();
        fragments.push(block);
    }

    let mut other = original.to_string();
    for fragment in &fragments {
        other = other.replacen(fragment.as_str(), "", 1).trim().to_string();
    }
    details.other = other;

    for field in [
        &mut details.hours,
        &mut details.specific_hours,
        &mut details.description,
        &mut details.prerequisites,
        &mut details.course_fees,
        &mut details.other,
    ] {
        *field = clean_text(field);
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(body: &str) -> String {
        format!(
            "<html><body><table><tr><td><p><h1 id=\"course_preview_title\">ENGL 1310 - College Writing I</h1>{body}</p></td></tr></table></body></html>"
        )
    }

    #[test]
    fn splits_hours_description_prereqs_and_fees() {
        let html = page(
            "3 hours (3;0;0)<br>Introduction to academic writing.<br><strong>Prerequisite(s):</strong> ENGL 1300 or equivalent. May be repeated for credit.<br>Course specific fees may apply: $25 lab fee",
        );
        let details = parse_course_detail_html(&html).expect("parse");
        assert_eq!(details.hours, "3");
        assert_eq!(details.specific_hours, "(3;0;0)");
        assert_eq!(details.description, "Introduction to academic writing.");
        assert_eq!(details.prerequisites, "ENGL 1300 or equivalent.");
        assert_eq!(details.course_fees, "$25 lab fee");
        assert_eq!(details.other, "May be repeated for credit.");
    }

    #[test]
    fn prerequisite_none_is_blank() {
        let html = page("1-3 hours<br>Independent study.<br>Prerequisite(s): None.");
        let details = parse_course_detail_html(&html).expect("parse");
        assert_eq!(details.hours, "1-3");
        assert!(details.specific_hours.is_empty());
        assert_eq!(details.description, "Independent study.");
        assert!(details.prerequisites.is_empty());
        assert!(details.other.is_empty());
    }

    #[test]
    fn missing_title_yields_empty_details() {
        let details = parse_course_detail_html("<html><body><p>nothing</p></body></html>").expect("parse");
        assert!(details.is_empty());
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  a \n b ,c  "), "a b,c");
    }
}
