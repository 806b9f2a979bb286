//! XML framing: top-level element boundary extraction.
//!
//! The engine never holds a DOM. Incoming bytes accumulate in a buffer;
//! this module finds the boundary of the next complete top-level element
//! (stanza, negotiation element, stream header or close tag) and hands
//! the slice to the classifier. Incomplete XML simply waits for the next
//! socket read.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::warn;

use crate::stanza::{StanzaKind, StreamHeader};

/// Namespaces the engine negotiates against
pub mod ns {
    pub const STREAMS: &str = "http://etherx.jabber.org/streams";
    pub const CLIENT: &str = "jabber:client";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
    pub const COMPRESS_PROTOCOL: &str = "http://jabber.org/protocol/compress";
    pub const AUTH_LEGACY: &str = "jabber:iq:auth";
}

/// Opening tag for a client-to-server stream
pub fn stream_open(service_name: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' version='1.0' \
         xmlns='{}' xmlns:stream='{}'>",
        service_name,
        ns::CLIENT,
        ns::STREAMS
    )
}

pub const STREAM_CLOSE: &str = "</stream:stream>";

/// State machine for top-level element boundary detection
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Between top-level elements
    Idle,
    /// Inside a top-level element, tracking depth
    InElement,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Extract a single complete top-level element from the buffer slice.
///
/// Returns `Some((element_text, bytes_consumed))` when a complete element
/// (or the stream opening/closing tag, which have no matching pair in the
/// buffer) was found, `None` when more bytes are needed. Leading
/// whitespace - such as keep-alive bytes - is consumed along with the
/// element.
pub fn extract_element(buffer: &[u8]) -> Option<(String, usize)> {
    // The stream closing tag appears alone, without its opening tag in
    // the buffer, so the XML reader below would reject it.
    let first_content = buffer
        .iter()
        .position(|&b| b != b' ' && b != b'\t' && b != b'\n' && b != b'\r');
    if let Some(start) = first_content {
        if buffer[start..].starts_with(STREAM_CLOSE.as_bytes()) {
            return Some((STREAM_CLOSE.to_string(), start + STREAM_CLOSE.len()));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut element_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                // The stream header never closes while the connection
                // lives; return the opening tag as its own element.
                if state == ParserState::Idle && is_stream_root(e.name().as_ref()) {
                    let tag_end = reader.buffer_position() as usize;
                    return Some((bytes_to_string(&buffer[0..tag_end]), tag_end));
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InElement;
                    element_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle && is_stream_root(e.name().as_ref()) {
                    let tag_end = reader.buffer_position() as usize;
                    return Some((bytes_to_string(&buffer[0..tag_end]), tag_end));
                }

                // Self-closing top-level element, e.g. <presence/>
                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Some((bytes_to_string(&buffer[pos..tag_end]), tag_end));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if is_stream_root(e.name().as_ref()) && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Some((STREAM_CLOSE.to_string(), tag_end));
                }

                depth = depth.saturating_sub(1);
                if state == ParserState::InElement && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Some((bytes_to_string(&buffer[element_start..tag_end]), tag_end));
                }
            }
            Ok(Event::Eof) => {
                // Incomplete element, wait for more bytes
                return None;
            }
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => {
                // Expected during streaming: a partial tag sits at the
                // end of the buffer.
                return None;
            }
            Err(e) => {
                warn!(error = ?e, "XML framing error");
                return None;
            }
        }
    }
}

fn is_stream_root(name: &[u8]) -> bool {
    name == b"stream:stream" || name == b"stream"
}

/// Classification of a complete top-level element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    /// Response `<stream:stream ...>` opening tag
    StreamHeader,
    /// `</stream:stream>`
    StreamClose,
    /// `<stream:features/>`
    Features,
    /// Fatal `<stream:error/>`
    StreamError,
    /// message / iq / presence
    Stanza(StanzaKind),
    SaslChallenge,
    SaslSuccess,
    SaslFailure,
    TlsProceed,
    TlsFailure,
    /// `<compressed/>` - the codec swap point
    CompressionAck,
    /// Compression denied; recoverable, the stream continues uncompressed
    CompressionFailure,
    Unknown,
}

/// Classify a complete top-level element by root name and namespace
pub fn classify(element: &str) -> ElementKind {
    if element == STREAM_CLOSE {
        return ElementKind::StreamClose;
    }

    let (name, xmlns) = match root_name_and_xmlns(element) {
        Some(pair) => pair,
        None => return ElementKind::Unknown,
    };

    match name.as_str() {
        "stream" => ElementKind::StreamHeader,
        "features" => ElementKind::Features,
        "error" => ElementKind::StreamError,
        "message" => ElementKind::Stanza(StanzaKind::Message),
        "iq" => ElementKind::Stanza(StanzaKind::Iq),
        "presence" => ElementKind::Stanza(StanzaKind::Presence),
        "challenge" => ElementKind::SaslChallenge,
        "success" => ElementKind::SaslSuccess,
        "proceed" => ElementKind::TlsProceed,
        "compressed" => ElementKind::CompressionAck,
        "failure" => match xmlns.as_deref() {
            Some(ns::TLS) => ElementKind::TlsFailure,
            Some(ns::COMPRESS_PROTOCOL) => ElementKind::CompressionFailure,
            // SASL failures are the common case; some servers omit the
            // namespace entirely.
            _ => ElementKind::SaslFailure,
        },
        _ => ElementKind::Unknown,
    }
}

fn root_name_and_xmlns(element: &str) -> Option<(String, Option<String>)> {
    let mut reader = Reader::from_str(element);
    reader.config_mut().check_end_names = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let mut xmlns = None;
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"xmlns" {
                        xmlns = Some(String::from_utf8_lossy(&attr.value).into_owned());
                    }
                }
                return Some((name, xmlns));
            }
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) => continue,
            _ => return None,
        }
    }
}

/// Parse the attributes of a response stream header
pub fn parse_stream_header(element: &str) -> StreamHeader {
    let mut header = StreamHeader::default();
    let mut reader = Reader::from_str(element);
    reader.config_mut().check_end_names = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                for attr in e.attributes().flatten() {
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    match attr.key.as_ref() {
                        b"id" => header.id = Some(value),
                        b"from" => header.from = Some(value),
                        b"version" => header.version = Some(value),
                        _ => {}
                    }
                }
                break;
            }
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) => continue,
            _ => break,
        }
    }
    header
}

/// Text content of a simple element, e.g. the base64 payload of
/// `<challenge/>` or `<success/>`
pub fn text_content(element: &str) -> String {
    let mut reader = Reader::from_str(element);
    reader.config_mut().check_end_names = false;

    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Text(t)) => {
                text.push_str(&t.unescape().unwrap_or_default());
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    text.trim().to_string()
}

/// Name of the first child element, e.g. the defined condition of a
/// `<stream:error/>` or SASL `<failure/>`
pub fn first_child_name(element: &str) -> Option<String> {
    let mut reader = Reader::from_str(element);
    reader.config_mut().check_end_names = false;

    let mut depth = 0u32;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 2 {
                    return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 {
                    return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                }
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Text content of the named descendant element, e.g. the `<jid/>` of a
/// bind result
pub fn child_text(element: &str, child: &str) -> Option<String> {
    let mut reader = Reader::from_str(element);
    reader.config_mut().check_end_names = false;

    let mut capturing = false;
    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == child.as_bytes() {
                    capturing = true;
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == child.as_bytes() {
                    return Some(String::new());
                }
            }
            Ok(Event::Text(t)) if capturing => {
                text.push_str(&t.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) => {
                if capturing && e.local_name().as_ref() == child.as_bytes() {
                    return Some(text);
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Whether the element contains a descendant with the given local name
pub fn has_child(element: &str, child: &str) -> bool {
    let mut reader = Reader::from_str(element);
    reader.config_mut().check_end_names = false;

    let mut saw_root = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if !saw_root {
                    saw_root = true;
                    continue;
                }
                if e.local_name().as_ref() == child.as_bytes() {
                    return true;
                }
            }
            Ok(Event::Eof) | Err(_) => return false,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_stream_opening() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
                    xmlns:stream='http://etherx.jabber.org/streams' id='c1' version='1.0'>";
        let (element, consumed) = extract_element(buf).unwrap();
        assert!(element.contains("<stream:stream"));
        assert_eq!(consumed, buf.len());
        assert_eq!(classify(&element), ElementKind::StreamHeader);

        let header = parse_stream_header(&element);
        assert_eq!(header.id.as_deref(), Some("c1"));
        assert!(!header.is_legacy());
    }

    #[test]
    fn extracts_nested_stanza() {
        let buf = b"<iq type='result' id='1'><query xmlns='jabber:iq:roster'>\
                    <item jid='user@example.test'/></query></iq>";
        let (element, consumed) = extract_element(buf).unwrap();
        assert!(element.ends_with("</iq>"));
        assert_eq!(consumed, buf.len());
        assert_eq!(classify(&element), ElementKind::Stanza(StanzaKind::Iq));
    }

    #[test]
    fn extracts_consecutive_elements() {
        let buf = b"<presence/><message to='a@b'><body>Hi</body></message>";
        let (first, used) = extract_element(buf).unwrap();
        assert_eq!(first, "<presence/>");
        let (second, _) = extract_element(&buf[used..]).unwrap();
        assert!(second.contains("Hi"));
    }

    #[test]
    fn incomplete_element_waits_for_more_bytes() {
        assert!(extract_element(b"<iq type='get'><query xmlns='jabber:iq:auth'>").is_none());
        assert!(extract_element(b"<mess").is_none());
        assert!(extract_element(b"").is_none());
        assert!(extract_element(b"   \n").is_none());
    }

    #[test]
    fn keepalive_whitespace_is_consumed_with_next_element() {
        let buf = b"  <presence/>";
        let (element, consumed) = extract_element(buf).unwrap();
        assert_eq!(element, "<presence/>");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn stream_close_with_leading_whitespace() {
        let (element, consumed) = extract_element(b" </stream:stream>").unwrap();
        assert_eq!(element, STREAM_CLOSE);
        assert_eq!(consumed, 17);
        assert_eq!(classify(&element), ElementKind::StreamClose);
    }

    #[test]
    fn classifies_negotiation_elements() {
        assert_eq!(
            classify("<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>AAA=</challenge>"),
            ElementKind::SaslChallenge
        );
        assert_eq!(
            classify("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>"),
            ElementKind::SaslSuccess
        );
        assert_eq!(
            classify("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"),
            ElementKind::TlsProceed
        );
        assert_eq!(
            classify("<compressed xmlns='http://jabber.org/protocol/compress'/>"),
            ElementKind::CompressionAck
        );
    }

    #[test]
    fn failure_routing_by_namespace() {
        assert_eq!(
            classify("<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"),
            ElementKind::TlsFailure
        );
        assert_eq!(
            classify("<failure xmlns='http://jabber.org/protocol/compress'>\
                      <unsupported-method/></failure>"),
            ElementKind::CompressionFailure
        );
        assert_eq!(
            classify("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                      <not-authorized/></failure>"),
            ElementKind::SaslFailure
        );
    }

    #[test]
    fn stream_error_condition_extraction() {
        let element = "<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
                       </stream:error>";
        assert_eq!(classify(element), ElementKind::StreamError);
        assert_eq!(first_child_name(element).as_deref(), Some("conflict"));
    }

    #[test]
    fn challenge_text_is_extracted() {
        assert_eq!(
            text_content("<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\ncj1hYmM=\n</challenge>"),
            "cj1hYmM="
        );
        assert_eq!(text_content("<success/>"), "");
    }

    #[test]
    fn child_text_finds_bound_jid() {
        let element = "<iq type='result' id='b1'>\
                       <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                       <jid>user@example.test/mobile</jid></bind></iq>";
        assert_eq!(
            child_text(element, "jid").as_deref(),
            Some("user@example.test/mobile")
        );
        assert!(child_text(element, "resource").is_none());
    }

    #[test]
    fn has_child_skips_the_root_element() {
        let element = "<iq type='result'><query xmlns='jabber:iq:auth'>\
                       <username/><password/><digest/><resource/></query></iq>";
        assert!(has_child(element, "digest"));
        assert!(has_child(element, "password"));
        assert!(!has_child(element, "token"));
        // The root name itself is not a child
        assert!(!has_child("<iq type='result'/>", "iq"));
    }

    #[test]
    fn fragmented_features_complete_later() {
        let part = b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>";
        assert!(extract_element(part).is_none());

        let mut full = part.to_vec();
        full.extend_from_slice(b"</stream:features>");
        let (element, _) = extract_element(&full).unwrap();
        assert_eq!(classify(&element), ElementKind::Features);
    }
}
