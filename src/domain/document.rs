//! Conversion inputs and outputs.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use super::error::DomainError;

/// Leading bytes of every well-formed PDF file.
pub const PDF_SIGNATURE: &[u8] = b"%PDF-";

/// Raw conversion input as supplied by a caller.
///
/// Exactly one of `url` or `html` must carry a value. Blank strings count as
/// absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConversionRequest {
    pub url: Option<String>,
    pub html: Option<String>,
}

impl ConversionRequest {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            html: None,
        }
    }

    pub fn from_html(html: impl Into<String>) -> Self {
        Self {
            url: None,
            html: Some(html.into()),
        }
    }

    /// Check the request shape and turn it into a typed document source.
    pub fn validate(self) -> Result<DocumentSource, DomainError> {
        let url = self.url.filter(|value| !value.trim().is_empty());
        let html = self.html.filter(|value| !value.trim().is_empty());

        match (url, html) {
            (Some(_), Some(_)) => Err(DomainError::validation(
                "provide either `url` or `html`, not both",
            )),
            (None, None) => Err(DomainError::validation(
                "either `url` or `html` is required",
            )),
            (Some(raw), None) => parse_source_url(raw.trim()).map(DocumentSource::Url),
            (None, Some(html)) => Ok(DocumentSource::Html(html)),
        }
    }
}

fn parse_source_url(raw: &str) -> Result<Url, DomainError> {
    let url = Url::parse(raw).map_err(|err| {
        DomainError::validation(format!("`url` is not a valid absolute URL: {err}"))
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(DomainError::validation(format!(
                "`url` must use http or https, got `{other}`"
            )));
        }
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(DomainError::validation("`url` must include a host"));
    }

    Ok(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Url,
    Html,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Url => "url",
            SourceKind::Html => "html",
        }
    }
}

/// A validated document to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    Url(Url),
    Html(String),
}

impl DocumentSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            DocumentSource::Url(_) => SourceKind::Url,
            DocumentSource::Html(_) => SourceKind::Html,
        }
    }
}

/// Rendered PDF payload.
#[derive(Debug, Clone)]
pub struct PdfDocument {
    bytes: Bytes,
}

impl PdfDocument {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn has_signature(&self) -> bool {
        self.bytes.starts_with(PDF_SIGNATURE)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validation_message(request: ConversionRequest) -> String {
        match request.validate() {
            Err(DomainError::Validation { message }) => message,
            Ok(source) => panic!("expected validation failure, got {source:?}"),
        }
    }

    #[test]
    fn html_only_request_is_accepted() {
        let source = ConversionRequest::from_html("<h1>Hi</h1>")
            .validate()
            .expect("valid request");
        assert_eq!(source, DocumentSource::Html("<h1>Hi</h1>".to_string()));
        assert_eq!(source.kind(), SourceKind::Html);
    }

    #[test]
    fn absolute_url_is_accepted() {
        let source = ConversionRequest::from_url("https://example.com/report?id=7")
            .validate()
            .expect("valid request");
        match source {
            DocumentSource::Url(url) => assert_eq!(url.host_str(), Some("example.com")),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn both_sources_are_rejected() {
        let request = ConversionRequest {
            url: Some("https://example.com".to_string()),
            html: Some("<p>x</p>".to_string()),
        };
        assert!(validation_message(request).contains("not both"));
    }

    #[test]
    fn missing_sources_are_rejected() {
        let message = validation_message(ConversionRequest::default());
        assert!(message.contains("required"), "unexpected message: {message}");
    }

    #[test]
    fn blank_values_count_as_absent() {
        let request = ConversionRequest {
            url: Some("   ".to_string()),
            html: Some("<p>x</p>".to_string()),
        };
        assert!(request.validate().is_ok());

        let request = ConversionRequest::from_html(" \n\t ");
        assert!(validation_message(request).contains("required"));
    }

    #[test]
    fn relative_or_malformed_urls_are_rejected() {
        for raw in ["not-a-url", "/relative/path", "http://", "example.com"] {
            let message = validation_message(ConversionRequest::from_url(raw));
            assert!(message.contains("url"), "{raw}: {message}");
        }
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        for raw in ["file:///etc/passwd", "ftp://example.com/a.html", "data:text/html,hi"] {
            let message = validation_message(ConversionRequest::from_url(raw));
            assert!(message.contains("http"), "{raw}: {message}");
        }
    }

    #[test]
    fn pdf_signature_is_detected() {
        assert!(PdfDocument::new(b"%PDF-1.7\n".to_vec()).has_signature());
        assert!(!PdfDocument::new(b"<html>".to_vec()).has_signature());
        assert!(PdfDocument::new(Vec::new()).is_empty());
    }
}
