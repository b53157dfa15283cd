use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use url::Url;

static POST_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https://www\.instagram\.com/(?:p|reel|tv)/([A-Za-z0-9_-]+)/?")
        .expect("valid post link regex")
});
static ACCOUNT_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https://www\.instagram\.com/([A-Za-z0-9_.]+)/?$")
        .expect("valid account link regex")
});

const POST_ID_LENGTH: usize = 11;

/// A recognized content link from an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLink {
    Post { post_id: String, url: String },
    Account { username: String, url: String },
}

#[derive(Debug, Error)]
pub enum LinkParseError {
    #[error("invalid content link: {0}")]
    InvalidLink(String),
    #[error("invalid post id: {0}")]
    InvalidPostId(String),
}

/// Classifies one line of user input as a post link or an account link.
pub fn parse_content_link(text: &str) -> Result<ParsedLink, LinkParseError> {
    let trimmed = text.trim();
    if Url::parse(trimmed).is_err() {
        return Err(LinkParseError::InvalidLink(trimmed.to_string()));
    }

    if let Some(captures) = POST_LINK.captures(trimmed) {
        let post_id = captures[1].to_string();
        if post_id.len() != POST_ID_LENGTH {
            return Err(LinkParseError::InvalidPostId(post_id));
        }
        return Ok(ParsedLink::Post {
            post_id,
            url: trimmed.to_string(),
        });
    }

    if let Some(captures) = ACCOUNT_LINK.captures(trimmed) {
        return Ok(ParsedLink::Account {
            username: captures[1].to_string(),
            url: trimmed.to_string(),
        });
    }

    Err(LinkParseError::InvalidLink(trimmed.to_string()))
}

/// Splits `/reschedule` arguments into a post id and an RFC3339 time.
pub fn parse_reschedule_args(args: &str) -> Option<(String, DateTime<Utc>)> {
    let mut parts = args.split_whitespace();
    let post_id = parts.next()?.to_string();
    let raw_time = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let time = DateTime::parse_from_rfc3339(raw_time).ok()?;
    Some((post_id, time.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_post_and_reel_links() {
        let parsed = parse_content_link("https://www.instagram.com/p/vahj5AN8aek/").unwrap();
        assert_eq!(
            parsed,
            ParsedLink::Post {
                post_id: "vahj5AN8aek".to_string(),
                url: "https://www.instagram.com/p/vahj5AN8aek/".to_string(),
            }
        );

        assert!(matches!(
            parse_content_link("https://www.instagram.com/reel/abcDEF12345"),
            Ok(ParsedLink::Post { .. })
        ));
    }

    #[test]
    fn rejects_malformed_post_ids() {
        assert!(matches!(
            parse_content_link("https://www.instagram.com/p/short/"),
            Err(LinkParseError::InvalidPostId(_))
        ));
    }

    #[test]
    fn parses_account_links() {
        let parsed = parse_content_link("https://www.instagram.com/john.doe_42/").unwrap();
        assert_eq!(
            parsed,
            ParsedLink::Account {
                username: "john.doe_42".to_string(),
                url: "https://www.instagram.com/john.doe_42/".to_string(),
            }
        );
    }

    #[test]
    fn rejects_non_links_and_foreign_hosts() {
        assert!(parse_content_link("hello there").is_err());
        assert!(parse_content_link("https://example.com/p/vahj5AN8aek/").is_err());
    }

    #[test]
    fn reschedule_args_require_post_id_and_rfc3339_time() {
        let (post_id, time) =
            parse_reschedule_args("vahj5AN8aek 2026-01-01T12:00:00Z").unwrap();
        assert_eq!(post_id, "vahj5AN8aek");
        assert_eq!(time.to_rfc3339(), "2026-01-01T12:00:00+00:00");

        assert!(parse_reschedule_args("vahj5AN8aek").is_none());
        assert!(parse_reschedule_args("vahj5AN8aek tomorrow").is_none());
        assert!(parse_reschedule_args("a b c").is_none());
    }
}
