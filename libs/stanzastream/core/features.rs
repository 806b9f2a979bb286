//! `<stream:features/>` analysis
//!
//! Features are parsed once per negotiation round (after the initial
//! stream open, after TLS, after compression, after authentication) and
//! drive the decision of which step comes next.

use quick_xml::events::Event;
use quick_xml::Reader;

/// What the server offered in the last `<stream:features/>`
#[derive(Debug, Clone, Default)]
pub struct StreamFeatures {
    /// `<starttls/>` offered
    pub starttls: bool,
    /// Server marked starttls `<required/>`
    pub starttls_required: bool,
    /// Advertised SASL mechanism names, server order
    pub mechanisms: Vec<String>,
    /// Resource binding offered
    pub bind: bool,
    /// Session establishment offered
    pub session: bool,
    /// Advertised compression methods, e.g. "zlib"
    pub compression_methods: Vec<String>,
}

impl StreamFeatures {
    /// Parse a complete `<stream:features/>` element
    pub fn parse(element: &str) -> StreamFeatures {
        let mut features = StreamFeatures::default();
        let mut reader = Reader::from_str(element);
        reader.config_mut().check_end_names = false;

        #[derive(PartialEq)]
        enum Section {
            None,
            StartTls,
            Mechanisms,
            Compression,
        }

        let mut section = Section::None;
        let mut capture: Option<&'static str> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    let name = e.local_name().as_ref().to_vec();
                    match name.as_slice() {
                        b"starttls" => {
                            features.starttls = true;
                            section = Section::StartTls;
                        }
                        b"required" if section == Section::StartTls => {
                            features.starttls_required = true;
                        }
                        b"mechanisms" => section = Section::Mechanisms,
                        b"mechanism" if section == Section::Mechanisms => {
                            capture = Some("mechanism");
                        }
                        b"compression" => section = Section::Compression,
                        b"method" if section == Section::Compression => {
                            capture = Some("method");
                        }
                        b"bind" => features.bind = true,
                        b"session" => features.session = true,
                        _ => {}
                    }
                }
                Ok(Event::Text(t)) => {
                    if let Some(kind) = capture.take() {
                        let value = t.unescape().unwrap_or_default().trim().to_string();
                        if !value.is_empty() {
                            match kind {
                                "mechanism" => features.mechanisms.push(value),
                                _ => features.compression_methods.push(value),
                            }
                        }
                    }
                }
                Ok(Event::End(e)) => {
                    capture = None;
                    match e.local_name().as_ref() {
                        b"starttls" | b"mechanisms" | b"compression" => section = Section::None,
                        _ => {}
                    }
                }
                Ok(Event::Eof) | Err(_) => break,
                _ => {}
            }
        }

        features
    }

    pub fn offers_compression(&self, method: &str) -> bool {
        self.compression_methods.iter().any(|m| m == method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_feature_set() {
        let features = StreamFeatures::parse(
            "<stream:features>\
             <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>SCRAM-SHA-256</mechanism><mechanism>PLAIN</mechanism></mechanisms>\
             <compression xmlns='http://jabber.org/features/compress'>\
             <method>zlib</method></compression>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
             <session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>\
             </stream:features>",
        );
        assert!(features.starttls);
        assert!(features.starttls_required);
        assert_eq!(features.mechanisms, vec!["SCRAM-SHA-256", "PLAIN"]);
        assert!(features.bind);
        assert!(features.session);
        assert!(features.offers_compression("zlib"));
    }

    #[test]
    fn absent_offers_stay_false() {
        let features = StreamFeatures::parse(
            "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism></mechanisms></stream:features>",
        );
        assert!(!features.starttls);
        assert!(!features.starttls_required);
        assert!(!features.bind);
        assert!(!features.session);
        assert!(features.compression_methods.is_empty());
    }

    #[test]
    fn empty_features_from_post_auth_round() {
        let features = StreamFeatures::parse("<stream:features/>");
        assert!(features.mechanisms.is_empty());
        assert!(!features.starttls);
    }
}
