//! WebDAV request bodies and multistatus parsing.

use std::io::Cursor;

use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use crate::error::{ProviderError, ProviderResult};

pub const DAV_NS: &str = "DAV:";
pub const CALDAV_NS: &str = "urn:ietf:params:xml:ns:caldav";
/// CalendarServer extensions (getctag).
pub const CS_NS: &str = "http://calendarserver.org/ns/";
/// Apple iCal extensions (calendar-color).
pub const ICAL_NS: &str = "http://apple.com/ns/ical/";

/// One `<response>` of a multistatus body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavResponse {
    pub href: String,
    /// Response-level status code, when the server sent one.
    pub status: Option<u16>,
    pub is_calendar: bool,
    pub display_name: Option<String>,
    pub color: Option<String>,
    pub ctag: Option<String>,
    pub etag: Option<String>,
    pub calendar_data: Option<String>,
}

struct Body {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl Body {
    fn new() -> Self {
        Self {
            writer: Writer::new(Cursor::new(Vec::new())),
        }
    }

    fn write(&mut self, event: Event<'_>) -> &mut Self {
        // Writing into a Vec cannot fail.
        self.writer
            .write_event(event)
            .expect("in-memory XML write failed");
        self
    }

    fn root(&mut self, name: &str, namespaces: &[(&str, &str)]) -> &mut Self {
        let mut start = BytesStart::new(name);
        for ns in namespaces {
            start.push_attribute(*ns);
        }
        self.write(Event::Start(start))
    }

    fn open(&mut self, name: &str) -> &mut Self {
        self.write(Event::Start(BytesStart::new(name)))
    }

    fn open_named(&mut self, name: &str, value: &str) -> &mut Self {
        let mut start = BytesStart::new(name);
        start.push_attribute(("name", value));
        self.write(Event::Start(start))
    }

    fn close(&mut self, name: &str) -> &mut Self {
        self.write(Event::End(BytesEnd::new(name)))
    }

    fn empty(&mut self, name: &str) -> &mut Self {
        self.write(Event::Empty(BytesStart::new(name)))
    }

    fn text_element(&mut self, name: &str, text: &str) -> &mut Self {
        self.open(name);
        self.write(Event::Text(BytesText::new(text)));
        self.close(name)
    }

    fn finish(self) -> String {
        String::from_utf8_lossy(&self.writer.into_inner().into_inner()).into_owned()
    }
}

/// PROPFIND body listing calendar collections with their tags.
pub fn propfind_calendars_body() -> String {
    let mut body = Body::new();
    body.root(
        "d:propfind",
        &[
            ("xmlns:d", DAV_NS),
            ("xmlns:cs", CS_NS),
            ("xmlns:ic", ICAL_NS),
        ],
    )
    .open("d:prop")
    .empty("d:resourcetype")
    .empty("d:displayname")
    .empty("ic:calendar-color")
    .empty("cs:getctag")
    .close("d:prop")
    .close("d:propfind");
    body.finish()
}

/// calendar-query REPORT body asking for the etag of every VEVENT resource.
pub fn etag_query_body() -> String {
    let mut body = Body::new();
    body.root(
        "c:calendar-query",
        &[("xmlns:d", DAV_NS), ("xmlns:c", CALDAV_NS)],
    )
    .open("d:prop")
    .empty("d:getetag")
    .close("d:prop")
    .open("c:filter")
    .open_named("c:comp-filter", "VCALENDAR")
    .open_named("c:comp-filter", "VEVENT")
    .close("c:comp-filter")
    .close("c:comp-filter")
    .close("c:filter")
    .close("c:calendar-query");
    body.finish()
}

/// calendar-multiget REPORT body fetching the data of `hrefs`.
pub fn multiget_body<S: AsRef<str>>(hrefs: &[S]) -> String {
    let mut body = Body::new();
    body.root(
        "c:calendar-multiget",
        &[("xmlns:d", DAV_NS), ("xmlns:c", CALDAV_NS)],
    )
    .open("d:prop")
    .empty("d:getetag")
    .empty("c:calendar-data")
    .close("d:prop");
    for href in hrefs {
        body.text_element("d:href", href.as_ref());
    }
    body.close("c:calendar-multiget");
    body.finish()
}

fn local_name(name: &[u8]) -> String {
    let name = String::from_utf8_lossy(name);
    name.rsplit(':').next().unwrap_or(&name).to_string()
}

/// `HTTP/1.1 404 Not Found` → 404.
fn status_code(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Parses a 207 multistatus body.
///
/// Anything that is not well-formed XML with a `multistatus` root is an
/// invalid server answer.
pub fn parse_multistatus(xml: &str) -> ProviderResult<Vec<DavResponse>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut responses = Vec::new();
    let mut current: Option<DavResponse> = None;
    let mut element: Option<String> = None;
    let mut in_propstat = false;
    let mut saw_root = false;
    let mut depth = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| {
            ProviderError::invalid_server(format!(
                "malformed multistatus at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;
        if matches!(event, Event::Start(_)) {
            depth += 1;
        }
        match event {
            Event::Start(e) | Event::Empty(e) => {
                let local = local_name(e.name().as_ref());
                if !saw_root {
                    if local != "multistatus" {
                        return Err(ProviderError::invalid_server(format!(
                            "expected multistatus, got <{}>",
                            local
                        )));
                    }
                    saw_root = true;
                    continue;
                }
                match local.as_str() {
                    "response" => current = Some(DavResponse::default()),
                    "propstat" => in_propstat = true,
                    "calendar" => {
                        if let Some(ref mut response) = current {
                            response.is_calendar = true;
                        }
                    }
                    "href" | "status" | "displayname" | "calendar-color" | "getctag"
                    | "getetag" | "calendar-data" => element = Some(local),
                    _ => {}
                }
            }
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    "response" => responses.extend(current.take()),
                    "propstat" => in_propstat = false,
                    _ => {}
                }
                element = None;
            }
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .map_err(|e| ProviderError::invalid_server(format!("bad XML text: {}", e)))?
                    .into_owned();
                assign(&mut current, element.as_deref(), text, in_propstat);
            }
            Event::CData(e) => {
                let text = String::from_utf8_lossy(&e).into_owned();
                assign(&mut current, element.as_deref(), text, in_propstat);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(ProviderError::invalid_server("empty multistatus body"));
    }
    if depth != 0 {
        return Err(ProviderError::invalid_server("truncated multistatus body"));
    }
    Ok(responses)
}

fn assign(current: &mut Option<DavResponse>, element: Option<&str>, text: String, in_propstat: bool) {
    let (Some(response), Some(element)) = (current.as_mut(), element) else {
        return;
    };
    match element {
        "href" if response.href.is_empty() => response.href = text,
        "status" if !in_propstat => response.status = status_code(&text),
        "displayname" => response.display_name = Some(text),
        "calendar-color" => response.color = Some(text),
        "getctag" => response.ctag = Some(text),
        "getetag" => response.etag = Some(text),
        "calendar-data" => match response.calendar_data {
            Some(ref mut data) => data.push_str(&text),
            None => response.calendar_data = Some(text),
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propfind_body_asks_for_collection_props() {
        let body = propfind_calendars_body();
        assert!(body.starts_with("<d:propfind"));
        for prop in ["resourcetype", "displayname", "calendar-color", "getctag"] {
            assert!(body.contains(prop), "missing {}", prop);
        }
    }

    #[test]
    fn etag_query_has_no_calendar_data() {
        let body = etag_query_body();
        assert!(body.contains("<d:getetag/>"));
        assert!(body.contains(r#"<c:comp-filter name="VEVENT">"#));
        assert!(!body.contains("calendar-data"));
    }

    #[test]
    fn multiget_escapes_hrefs() {
        let body = multiget_body(&["/cal/a.ics", "/cal/b&c.ics"]);
        assert!(body.contains("<d:href>/cal/a.ics</d:href>"));
        assert!(body.contains("<d:href>/cal/b&amp;c.ics</d:href>"));
        assert!(body.contains("<c:calendar-data/>"));
    }

    #[test]
    fn parses_calendar_collections() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<multistatus xmlns="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav" xmlns:CS="http://calendarserver.org/ns/">
  <response>
    <href>/calendars/alice/</href>
    <propstat>
      <prop><resourcetype><collection/></resourcetype></prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
  <response>
    <href>/calendars/alice/work/</href>
    <propstat>
      <prop>
        <displayname>Work</displayname>
        <resourcetype><collection/><C:calendar/></resourcetype>
        <CS:getctag>"ctag-7"</CS:getctag>
      </prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
</multistatus>"#;
        let responses = parse_multistatus(xml).unwrap();
        assert_eq!(responses.len(), 2);
        assert!(!responses[0].is_calendar);
        let work = &responses[1];
        assert!(work.is_calendar);
        assert_eq!(work.href, "/calendars/alice/work/");
        assert_eq!(work.display_name.as_deref(), Some("Work"));
        assert_eq!(work.ctag.as_deref(), Some("\"ctag-7\""));
        assert_eq!(work.status, None);
    }

    #[test]
    fn parses_report_with_data_and_missing_resources() {
        let xml = r#"<d:multistatus xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/cal/work/a.ics</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"e1"</d:getetag>
        <c:calendar-data><![CDATA[BEGIN:VCALENDAR
BEGIN:VEVENT
UID:a
SUMMARY:R&D
END:VEVENT
END:VCALENDAR]]></c:calendar-data>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/cal/work/gone.ics</d:href>
    <d:status>HTTP/1.1 404 Not Found</d:status>
  </d:response>
</d:multistatus>"#;
        let responses = parse_multistatus(xml).unwrap();
        assert_eq!(responses[0].etag.as_deref(), Some("\"e1\""));
        assert!(responses[0].calendar_data.as_deref().unwrap().contains("SUMMARY:R&D"));
        assert_eq!(responses[1].href, "/cal/work/gone.ics");
        assert_eq!(responses[1].status, Some(404));
        assert!(responses[1].calendar_data.is_none());
    }

    #[test]
    fn non_multistatus_is_invalid_server() {
        let err = parse_multistatus("<html><body>login</body></html>").unwrap_err();
        assert_eq!(err.code(), crate::ProviderErrorCode::InvalidServer);
        assert!(parse_multistatus("").is_err());
        assert!(parse_multistatus("<d:multistatus xmlns:d=\"DAV:\"><d:response>").is_err());
    }
}
