//! WebDAV multistatus parsing
//!
//! Namespace-tolerant: elements are matched by local name, so `d:`, `D:`,
//! `A:` and default-namespace documents all parse the same. The parser
//! yields one item per `<response>`; callers iterate and decide control
//! flow.

use crate::error::{SyncError, SyncResult};
use quick_xml::events::Event;
use quick_xml::Reader;

/// One `<response>` element of a multistatus document.
#[derive(Debug, Clone, Default)]
pub struct ResponseItem {
    pub href: String,
    /// The `<status>` line, e.g. `HTTP/1.1 404 Not Found`; empty when the
    /// response carried a propstat instead.
    pub status: String,
    pub etag: String,
    /// `address-data` or `calendar-data` body when requested.
    pub body: String,
    pub ctag: String,
    pub displayname: String,
    pub color: String,
    /// Local names of child elements of `<resourcetype>`.
    pub resource_types: Vec<String>,
    /// `name` attributes of `<comp>` elements.
    pub supported_components: Vec<String>,
    /// href values nested under property elements, keyed by the property's
    /// local name (`current-user-principal`, `addressbook-home-set`, …).
    pub property_hrefs: Vec<(String, String)>,
}

impl ResponseItem {
    pub fn status_code(&self) -> Option<u16> {
        self.status
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
    }

    pub fn is_collection_of(&self, kind: &str) -> bool {
        self.resource_types.iter().any(|t| t == kind)
    }

    pub fn supports_component(&self, name: &str) -> bool {
        self.supported_components.iter().any(|c| c == name)
    }

    pub fn property_href(&self, property: &str) -> Option<&str> {
        self.property_hrefs
            .iter()
            .find(|(p, _)| p == property)
            .map(|(_, href)| href.as_str())
    }
}

/// A parsed multistatus document.
#[derive(Debug, Default)]
pub struct Multistatus {
    pub responses: Vec<ResponseItem>,
    /// Document-level RFC 6578 `<sync-token>`.
    pub sync_token: String,
}

fn local_name(qname: &[u8]) -> String {
    let name = match qname.iter().position(|&b| b == b':') {
        Some(pos) => &qname[pos + 1..],
        None => qname,
    };
    String::from_utf8_lossy(name).to_string()
}

pub fn parse_multistatus(xml: &str) -> SyncResult<Multistatus> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut doc = Multistatus::default();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<ResponseItem> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "response" {
                    current = Some(ResponseItem::default());
                }
                if name == "comp" {
                    if let Some(item) = current.as_mut() {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"name" {
                                if let Ok(value) = attr.unescape_value() {
                                    item.supported_components.push(value.to_string());
                                }
                            }
                        }
                    }
                }
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "comp" {
                    if let Some(item) = current.as_mut() {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"name" {
                                if let Ok(value) = attr.unescape_value() {
                                    item.supported_components.push(value.to_string());
                                }
                            }
                        }
                    }
                }
                if stack.last().map(String::as_str) == Some("resourcetype") {
                    if let Some(item) = current.as_mut() {
                        item.resource_types.push(name);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|err| SyncError::parse(format!("XML text: {}", err)))?
                    .to_string();
                absorb_text(&mut doc, &mut current, &stack, text);
            }
            Ok(Event::CData(e)) => {
                let text = String::from_utf8_lossy(&e.into_inner()).to_string();
                absorb_text(&mut doc, &mut current, &stack, text);
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                stack.pop();
                if name == "response" {
                    if let Some(item) = current.take() {
                        doc.responses.push(item);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(SyncError::parse(format!("XML: {}", err))),
        }
    }
    Ok(doc)
}

fn absorb_text(
    doc: &mut Multistatus,
    current: &mut Option<ResponseItem>,
    stack: &[String],
    text: String,
) {
    let Some(element) = stack.last() else { return };

    match current {
        None => {
            // Document-level properties outside any <response>.
            if element == "sync-token" {
                doc.sync_token = text;
            }
        }
        Some(item) => match element.as_str() {
            "href" => {
                // An href directly under <response> is the resource href;
                // one nested under a property element belongs to it.
                let parent = stack.iter().rev().nth(1).map(String::as_str);
                match parent {
                    Some("response") => {
                        if item.href.is_empty() {
                            item.href = text;
                        }
                    }
                    Some(parent_name) if parent_name != "prop" => {
                        item.property_hrefs.push((parent_name.to_string(), text));
                    }
                    _ => {
                        if item.href.is_empty() {
                            item.href = text;
                        }
                    }
                }
            }
            "status" => item.status = text,
            "getetag" => item.etag = text.trim_matches('"').to_string(),
            "getctag" => item.ctag = text,
            "displayname" => item.displayname = text,
            "calendar-color" => item.color = text,
            "address-data" | "calendar-data" => item.body.push_str(&text),
            "sync-token" => doc.sync_token = text,
            _ => {}
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTACTS_PAGE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:" xmlns:card="urn:ietf:params:xml:ns:carddav">
  <d:response>
    <d:href>/books/default/a.vcf</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"etag-1"</d:getetag>
        <card:address-data>BEGIN:VCARD
VERSION:3.0
UID:u-1
END:VCARD</card:address-data>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/books/default/gone.vcf</d:href>
    <d:status>HTTP/1.1 404 Not Found</d:status>
  </d:response>
  <d:response>
    <d:href>/books/default/more.vcf</d:href>
    <d:status>HTTP/1.1 507 Insufficient Storage</d:status>
  </d:response>
  <d:sync-token>https://example.com/sync/42</d:sync-token>
</d:multistatus>"#;

    #[test]
    fn parses_hrefs_statuses_and_sync_token() {
        let doc = parse_multistatus(CONTACTS_PAGE).unwrap();
        assert_eq!(doc.responses.len(), 3);
        assert_eq!(doc.responses[0].href, "/books/default/a.vcf");
        assert_eq!(doc.responses[0].etag, "etag-1");
        assert!(doc.responses[0].body.contains("UID:u-1"));
        assert_eq!(doc.responses[1].status_code(), Some(404));
        assert_eq!(doc.responses[2].status_code(), Some(507));
        assert_eq!(doc.sync_token, "https://example.com/sync/42");
    }

    #[test]
    fn mixed_namespace_prefixes_parse_identically() {
        let upper = CONTACTS_PAGE.replace("d:", "D:").replace("card:", "C:");
        let doc = parse_multistatus(&upper).unwrap();
        assert_eq!(doc.responses.len(), 3);
        assert_eq!(doc.responses[0].etag, "etag-1");
    }

    #[test]
    fn extracts_principal_and_home_set_hrefs() {
        let xml = r#"<d:multistatus xmlns:d="DAV:" xmlns:card="urn:ietf:params:xml:ns:carddav">
  <d:response>
    <d:href>/</d:href>
    <d:propstat><d:prop>
      <d:current-user-principal><d:href>/principals/u1/</d:href></d:current-user-principal>
      <card:addressbook-home-set><d:href>/books/u1/</d:href></card:addressbook-home-set>
    </d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;
        let doc = parse_multistatus(xml).unwrap();
        let item = &doc.responses[0];
        assert_eq!(item.href, "/");
        assert_eq!(item.property_href("current-user-principal"), Some("/principals/u1/"));
        assert_eq!(item.property_href("addressbook-home-set"), Some("/books/u1/"));
    }

    #[test]
    fn reads_resource_types_and_components() {
        let xml = r#"<d:multistatus xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:cs="http://calendarserver.org/ns/">
  <d:response>
    <d:href>/cal/work/</d:href>
    <d:propstat><d:prop>
      <d:resourcetype><d:collection/><c:calendar/></d:resourcetype>
      <d:displayname>Work</d:displayname>
      <cs:getctag>ct-9</cs:getctag>
      <c:supported-calendar-component-set><c:comp name="VEVENT"/><c:comp name="VTODO"/></c:supported-calendar-component-set>
    </d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;
        let doc = parse_multistatus(xml).unwrap();
        let item = &doc.responses[0];
        assert!(item.is_collection_of("calendar"));
        assert!(item.supports_component("VEVENT"));
        assert_eq!(item.ctag, "ct-9");
        assert_eq!(item.displayname, "Work");
    }
}
