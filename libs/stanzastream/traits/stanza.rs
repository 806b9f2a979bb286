use quick_xml::events::Event;
use quick_xml::Reader;

/// The three top-level stanza kinds of the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Iq,
    Presence,
}

impl StanzaKind {
    pub fn tag_name(&self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Iq => "iq",
            StanzaKind::Presence => "presence",
        }
    }

    fn from_tag(name: &[u8]) -> Option<Self> {
        match name {
            b"message" => Some(StanzaKind::Message),
            b"iq" => Some(StanzaKind::Iq),
            b"presence" => Some(StanzaKind::Presence),
            _ => None,
        }
    }
}

/// Structured error carried by a stanza of type="error"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    /// Defined condition element name, e.g. "service-unavailable"
    pub condition: String,
    /// Optional human-readable text
    pub text: Option<String>,
}

/// One top-level unit of the wire protocol.
///
/// The engine only interprets the identity attributes of the root element
/// (`id`, `from`, `to`, `type`) and an optional `<error/>` child; the XML
/// payload itself is opaque and carried verbatim. Higher layers own the
/// full (de)serialization of stanza bodies.
#[derive(Debug, Clone)]
pub struct Stanza {
    pub kind: StanzaKind,
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub type_attr: Option<String>,
    pub error: Option<StanzaError>,
    xml: String,
}

impl Stanza {
    /// Parse the identity attributes of a complete top-level element.
    ///
    /// Returns `None` when the root element is not a stanza kind.
    pub fn parse(xml: &str) -> Option<Stanza> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().check_end_names = false;

        let (kind, id, from, to, type_attr) = match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let kind = StanzaKind::from_tag(e.local_name().as_ref())?;
                let mut id = None;
                let mut from = None;
                let mut to = None;
                let mut type_attr = None;
                for attr in e.attributes().flatten() {
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    match attr.key.as_ref() {
                        b"id" => id = Some(value),
                        b"from" => from = Some(value),
                        b"to" => to = Some(value),
                        b"type" => type_attr = Some(value),
                        _ => {}
                    }
                }
                (kind, id, from, to, type_attr)
            }
            _ => return None,
        };

        let error = if type_attr.as_deref() == Some("error") {
            parse_error_child(xml)
        } else {
            None
        };

        Some(Stanza {
            kind,
            id,
            from,
            to,
            type_attr,
            error,
            xml: xml.to_string(),
        })
    }

    /// Build an outgoing stanza from its parts. `payload` is raw XML
    /// placed inside the root element; attribute values are escaped here.
    pub fn build(
        kind: StanzaKind,
        id: Option<&str>,
        to: Option<&str>,
        type_attr: Option<&str>,
        payload: &str,
    ) -> Stanza {
        let tag = kind.tag_name();
        let mut xml = format!("<{tag}");
        if let Some(id) = id {
            xml.push_str(&format!(" id='{}'", escape_attr(id)));
        }
        if let Some(to) = to {
            xml.push_str(&format!(" to='{}'", escape_attr(to)));
        }
        if let Some(type_attr) = type_attr {
            xml.push_str(&format!(" type='{}'", escape_attr(type_attr)));
        }
        if payload.is_empty() {
            xml.push_str("/>");
        } else {
            xml.push('>');
            xml.push_str(payload);
            xml.push_str(&format!("</{tag}>"));
        }
        Stanza {
            kind,
            id: id.map(str::to_string),
            from: None,
            to: to.map(str::to_string),
            type_attr: type_attr.map(str::to_string),
            error: None,
            xml,
        }
    }

    /// Available presence, sent right after a successful login
    pub fn presence_available() -> Stanza {
        Stanza::build(StanzaKind::Presence, None, None, None, "")
    }

    /// Unavailable presence, sent as the last stanza of an orderly shutdown
    pub fn presence_unavailable() -> Stanza {
        Stanza::build(StanzaKind::Presence, None, None, Some("unavailable"), "")
    }

    /// Raw XML text of this stanza, exactly as it goes on the wire
    pub fn as_xml(&self) -> &str {
        &self.xml
    }

    /// Replace the stanza wholesale with new XML; the identity
    /// attributes are re-read from it. This is how interceptors rewrite
    /// outgoing traffic. Returns false (leaving the stanza untouched)
    /// when the new text is not a stanza.
    pub fn replace_xml(&mut self, xml: &str) -> bool {
        match Stanza::parse(xml) {
            Some(parsed) => {
                *self = parsed;
                true
            }
            None => false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.type_attr.as_deref() == Some("error")
    }

    /// True for `<iq/>` of type result or error, i.e. a reply that can
    /// complete a pending request
    pub(crate) fn is_iq_reply(&self) -> bool {
        self.kind == StanzaKind::Iq
            && matches!(self.type_attr.as_deref(), Some("result") | Some("error"))
    }
}

/// Identity of the server stream, taken from the response stream header
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// Connection id assigned by the server
    pub id: Option<String>,
    /// Server identity from the `from` attribute
    pub from: Option<String>,
    /// Stream version; pre-1.0 servers send none and offer no features
    pub version: Option<String>,
}

impl StreamHeader {
    /// Legacy servers (no version, or version < 1.0) never send
    /// `<stream:features/>`, so negotiation ends at the opening tag.
    pub fn is_legacy(&self) -> bool {
        match self.version.as_deref() {
            None => true,
            Some(v) => !v.starts_with("1."),
        }
    }
}

/// Extract the first defined-condition child of the stanza's `<error/>`
fn parse_error_child(xml: &str) -> Option<StanzaError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().check_end_names = false;

    let mut depth = 0u32;
    let mut in_error_at = None;
    let mut condition = None;
    let mut text = None;
    let mut capture_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                let name = e.local_name().as_ref().to_vec();
                if name == b"error" && in_error_at.is_none() && depth == 2 {
                    in_error_at = Some(depth);
                } else if let Some(err_depth) = in_error_at {
                    if depth == err_depth + 1 {
                        if name == b"text" {
                            capture_text = true;
                        } else if condition.is_none() {
                            condition = Some(String::from_utf8_lossy(&name).into_owned());
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                let name = e.local_name().as_ref().to_vec();
                if let Some(err_depth) = in_error_at {
                    if depth == err_depth && condition.is_none() && name != b"text" {
                        condition = Some(String::from_utf8_lossy(&name).into_owned());
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if capture_text {
                    text = Some(t.unescape().unwrap_or_default().into_owned());
                    capture_text = false;
                }
            }
            Ok(Event::End(_)) => {
                if let Some(err_depth) = in_error_at {
                    if depth == err_depth {
                        break;
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    condition.map(|condition| StanzaError { condition, text })
}

/// Escape a string for use inside a single-quoted XML attribute
pub fn escape_attr(value: &str) -> String {
    quick_xml::escape::escape(value).replace('\'', "&apos;")
}

/// Escape a string for use as XML text content
pub fn escape_text(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iq_identity_attributes() {
        let stanza = Stanza::parse(
            "<iq type='result' id='bind_1' from='example.test' to='user@example.test'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>",
        )
        .unwrap();
        assert_eq!(stanza.kind, StanzaKind::Iq);
        assert_eq!(stanza.id.as_deref(), Some("bind_1"));
        assert_eq!(stanza.from.as_deref(), Some("example.test"));
        assert_eq!(stanza.to.as_deref(), Some("user@example.test"));
        assert_eq!(stanza.type_attr.as_deref(), Some("result"));
        assert!(stanza.error.is_none());
    }

    #[test]
    fn parses_self_closing_presence() {
        let stanza = Stanza::parse("<presence/>").unwrap();
        assert_eq!(stanza.kind, StanzaKind::Presence);
        assert!(stanza.id.is_none());
    }

    #[test]
    fn rejects_non_stanza_root() {
        assert!(Stanza::parse("<stream:features/>").is_none());
        assert!(Stanza::parse("<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").is_none());
    }

    #[test]
    fn extracts_error_condition_and_text() {
        let stanza = Stanza::parse(
            "<iq type='error' id='q1'><error type='cancel'>\
             <service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
             <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>gone away</text>\
             </error></iq>",
        )
        .unwrap();
        let error = stanza.error.unwrap();
        assert_eq!(error.condition, "service-unavailable");
        assert_eq!(error.text.as_deref(), Some("gone away"));
    }

    #[test]
    fn builds_escaped_outgoing_stanza() {
        let stanza = Stanza::build(
            StanzaKind::Message,
            Some("m'1"),
            Some("a&b@example.test"),
            Some("chat"),
            "<body>hi</body>",
        );
        assert!(stanza.as_xml().contains("id='m&apos;1'"));
        assert!(stanza.as_xml().contains("to='a&amp;b@example.test'"));
        assert!(stanza.as_xml().ends_with("</message>"));
    }

    #[test]
    fn legacy_header_detection() {
        assert!(StreamHeader::default().is_legacy());
        let modern = StreamHeader {
            version: Some("1.0".into()),
            ..Default::default()
        };
        assert!(!modern.is_legacy());
    }
}
