//! CoRE Link Format (RFC 6690) as carried in Register, Update and Discover
//! payloads, e.g. `</>;rt="oma.lwm2m";ct=11543,</1/1>,</3>;ver=1.1,</3/0>`.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkFormatError {
    #[error("Link target must be enclosed in <>: {0:?}")]
    MissingBrackets(String),

    #[error("Unterminated quoted attribute value in {0:?}")]
    UnterminatedQuote(String),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,
}

/// One link with its attributes in order of appearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub target: String,
    pub attributes: Vec<(String, Option<String>)>,
}

impl Link {
    #[must_use]
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes
            .push((name.to_string(), Some(value.to_string())));
        self
    }

    /// Value of the first attribute with the given name; quotes are stripped.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.target)?;
        for (name, value) in &self.attributes {
            match value {
                Some(v) if needs_quotes(v) => write!(f, ";{name}=\"{v}\"")?,
                Some(v) => write!(f, ";{name}={v}")?,
                None => write!(f, ";{name}")?,
            }
        }
        Ok(())
    }
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

/// Serializes links separated by commas.
#[must_use]
pub fn format_links(links: &[Link]) -> String {
    links
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a link-format payload.
///
/// # Errors
/// Returns an error on missing angle brackets, unterminated quotes or invalid UTF-8.
pub fn parse_links(payload: &[u8]) -> Result<Vec<Link>, LinkFormatError> {
    let text = std::str::from_utf8(payload).map_err(|_| LinkFormatError::InvalidUtf8)?;
    split_outside_quotes(text, ',')?
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .map(|entry| parse_link(entry.trim()))
        .collect()
}

fn parse_link(entry: &str) -> Result<Link, LinkFormatError> {
    let mut parts = split_outside_quotes(entry, ';')?.into_iter();
    let target = parts.next().unwrap_or_default();
    let target = target
        .strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .ok_or_else(|| LinkFormatError::MissingBrackets(entry.to_string()))?;

    let attributes = parts
        .map(|attr| match attr.split_once('=') {
            Some((name, value)) => (
                name.to_string(),
                Some(value.trim_matches('"').to_string()),
            ),
            None => (attr.to_string(), None),
        })
        .collect();

    Ok(Link {
        target: target.to_string(),
        attributes,
    })
}

fn split_outside_quotes(text: &str, separator: char) -> Result<Vec<&str>, LinkFormatError> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, c) in text.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == separator && !in_quotes {
            parts.push(&text[start..idx]);
            start = idx + c.len_utf8();
        }
    }
    if in_quotes {
        return Err(LinkFormatError::UnterminatedQuote(text.to_string()));
    }
    parts.push(&text[start..]);
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_payload() {
        let links =
            parse_links(br#"</>;rt="oma.lwm2m";ct=11543,</1/1>,</3>;ver=1.1,</3/0>"#).unwrap();
        assert_eq!(links.len(), 4);
        assert_eq!(links[0].target, "/");
        assert_eq!(links[0].attribute("rt"), Some("oma.lwm2m"));
        assert_eq!(links[0].attribute("ct"), Some("11543"));
        assert_eq!(links[2].attribute("ver"), Some("1.1"));
        assert_eq!(links[3].target, "/3/0");
    }

    #[test]
    fn test_quoted_comma() {
        let links = parse_links(br#"</1>;title="a,b",</2>"#).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].attribute("title"), Some("a,b"));
    }

    #[test]
    fn test_format_roundtrip_text() {
        let links = vec![
            Link::new("/3/0").with_attribute("dim", "2"),
            Link::new("/3/0/1"),
        ];
        assert_eq!(format_links(&links), "</3/0>;dim=2,</3/0/1>");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            parse_links(b"/3/0"),
            Err(LinkFormatError::MissingBrackets(_))
        ));
        assert!(matches!(
            parse_links(br#"</1>;rt="oops"#),
            Err(LinkFormatError::UnterminatedQuote(_))
        ));
        assert_eq!(parse_links(b"").unwrap(), vec![]);
    }
}
