use crate::stanza::{Stanza, StanzaKind};

/// Predicate over stanzas, used by collectors and listeners to select
/// the traffic they care about.
///
/// Closures `Fn(&Stanza) -> bool` implement this trait directly, so most
/// call sites never name a filter type.
pub trait StanzaFilter: Send + Sync {
    fn accept(&self, stanza: &Stanza) -> bool;
}

impl<F> StanzaFilter for F
where
    F: Fn(&Stanza) -> bool + Send + Sync,
{
    fn accept(&self, stanza: &Stanza) -> bool {
        self(stanza)
    }
}

/// Accepts every stanza; the behavior of a `None` filter
pub struct AcceptAll;

impl StanzaFilter for AcceptAll {
    fn accept(&self, _stanza: &Stanza) -> bool {
        true
    }
}

/// Accepts stanzas whose id attribute matches exactly.
///
/// This is the filter behind request/response correlation: a collector
/// with an `IdFilter` waits for the reply to a single outgoing request.
pub struct IdFilter {
    id: String,
}

impl IdFilter {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl StanzaFilter for IdFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.id.as_deref() == Some(self.id.as_str())
    }
}

/// Accepts stanzas of one kind (message, iq, presence)
pub struct KindFilter {
    kind: StanzaKind,
}

impl KindFilter {
    pub fn new(kind: StanzaKind) -> Self {
        Self { kind }
    }
}

impl StanzaFilter for KindFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.kind == self.kind
    }
}

/// Conjunction of filters; accepts only when every part accepts
pub struct AndFilter {
    parts: Vec<Box<dyn StanzaFilter>>,
}

impl AndFilter {
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn and(mut self, filter: impl StanzaFilter + 'static) -> Self {
        self.parts.push(Box::new(filter));
        self
    }
}

impl Default for AndFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl StanzaFilter for AndFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        self.parts.iter().all(|f| f.accept(stanza))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iq(id: &str) -> Stanza {
        Stanza::parse(&format!("<iq type='result' id='{id}'/>")).unwrap()
    }

    #[test]
    fn id_filter_matches_exact_id() {
        let filter = IdFilter::new("abc");
        assert!(filter.accept(&iq("abc")));
        assert!(!filter.accept(&iq("abcd")));
    }

    #[test]
    fn closures_are_filters() {
        let filter = |s: &Stanza| s.kind == StanzaKind::Iq;
        assert!(filter.accept(&iq("1")));
    }

    #[test]
    fn and_filter_requires_all_parts() {
        let filter = AndFilter::new()
            .and(KindFilter::new(StanzaKind::Iq))
            .and(IdFilter::new("x"));
        assert!(filter.accept(&iq("x")));
        assert!(!filter.accept(&iq("y")));
    }
}
