//! Site report XML
//!
//! Components contribute one XML fragment per site; the report wraps the
//! fragments of each site in a `<site>` element.

use crate::api::response::{xml_document, XmlWriter};
use chrono::Utc;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

pub trait SiteXmlContributor: Send + Sync {
    /// Self-contained XML for `site` (`scheme://host:port`). May be empty.
    /// A declaration, if present, is dropped.
    fn site_xml(&self, site: &str) -> String;
}

/// Parses a contributor fragment into events ready to be re-emitted inside
/// a `<site>` element. Declarations and top-level whitespace are dropped.
fn fragment_events(fragment: &str) -> Result<Vec<Event<'static>>, String> {
    let mut reader = Reader::from_str(fragment.trim_start_matches('\u{feff}'));
    let mut events = Vec::new();
    let mut depth = 0usize;
    loop {
        let event = reader.read_event().map_err(|e| e.to_string())?;
        match &event {
            Event::Eof => break,
            Event::Decl(_) => {
                warn!("Report fragment carried an XML declaration, dropping it");
                continue;
            }
            Event::DocType(_) => continue,
            Event::Text(text) if depth == 0 && text.iter().all(u8::is_ascii_whitespace) => continue,
            Event::Start(_) => depth += 1,
            Event::End(_) => depth = depth.saturating_sub(1),
            _ => {}
        }
        events.push(event.into_owned());
    }
    if depth != 0 {
        return Err("unclosed element".to_string());
    }
    Ok(events)
}

fn site_start(site: &str) -> BytesStart<'static> {
    let (scheme, rest) = site.split_once("://").unwrap_or(("http", site));
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => (host, port.to_string()),
        _ => (rest, if scheme == "https" { "443" } else { "80" }.to_string()),
    };
    let ssl = (scheme == "https").to_string();
    let mut start = BytesStart::new("site");
    start.push_attribute(("name", site));
    start.push_attribute(("host", host));
    start.push_attribute(("port", port.as_str()));
    start.push_attribute(("ssl", ssl.as_str()));
    start.into_owned()
}

fn write_site(writer: &mut XmlWriter, site: &str, contributors: &[&dyn SiteXmlContributor]) -> quick_xml::Result<()> {
    let start = site_start(site);
    let end = start.to_end().into_owned();
    writer.write_event(Event::Start(start))?;
    for contributor in contributors {
        match fragment_events(&contributor.site_xml(site)) {
            Ok(events) => {
                for event in events {
                    writer.write_event(event)?;
                }
            }
            Err(e) => warn!(%site, error = %e, "Skipping malformed report fragment"),
        }
    }
    writer.write_event(Event::End(end))
}

pub fn site_report(sites: &[String], contributors: &[&dyn SiteXmlContributor]) -> quick_xml::Result<String> {
    xml_document(|writer| {
        let generated = Utc::now().to_rfc2822();
        let mut start = BytesStart::new("report");
        start.push_attribute(("generated", generated.as_str()));
        let end = start.to_end().into_owned();
        writer.write_event(Event::Start(start))?;
        for site in sites {
            write_site(writer, site, contributors)?;
        }
        writer.write_event(Event::End(end))
    })
}
