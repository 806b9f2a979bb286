//! Authentication state machine.
//!
//! Drives the path Idle -> MechanismSelected -> ChallengeExchange(0..n)
//! -> Negotiated/Failed -> ResourceBinding -> SessionEstablishing ->
//! Done. Mechanism selection scans the connection's preference-ordered
//! registry for the first mechanism the server also advertises; when
//! nothing matches (or the server rejects SASL outright) the legacy
//! `jabber:iq:auth` handshake is used instead.
//!
//! Every wait in here is bounded: authentication 30s (5s anonymous),
//! resource binding and session establishment 30s each. Expiry is an
//! explicit error, never a hang.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionCore, LoginRequest};
use crate::connection_state::ConnectionState;
use crate::error::{Result, StreamEngineError};
use crate::features::StreamFeatures;
use crate::framing::{self, ns};
use crate::mechanism::{Anonymous, Credentials, SaslMechanism};
use crate::stanza::{escape_text, Stanza, StanzaKind};

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const ANONYMOUS_AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const BIND_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// SASL elements routed from the reader task to the waiting login call
pub(crate) enum SaslEvent {
    Challenge(Vec<u8>),
    Success(Vec<u8>),
    Failure(String),
}

/// How a SASL exchange ended without an engine-level error
enum SaslOutcome {
    Authenticated,
    /// Server sent `<failure/>`; legacy fallback applies
    ServerRejected(String),
}

impl ConnectionCore {
    pub(crate) async fn login_locked(
        &self,
        username: &str,
        password: &str,
        resource: &str,
    ) -> Result<String> {
        self.ensure_ready_for_login()?;

        let features = self.features.read().clone().unwrap_or_default();
        let credentials = Credentials {
            username: username.to_string(),
            password: password.to_string(),
            authzid: None,
        };
        let mechanism = if self.config.sasl_enabled {
            self.config
                .mechanisms
                .select(&features.mechanisms, &credentials)
        } else {
            None
        };

        let used_sasl = match mechanism {
            Some(mechanism) => {
                info!(mechanism = mechanism.name(), "authenticating via SASL");
                match self.sasl_exchange(mechanism, AUTH_TIMEOUT).await? {
                    SaslOutcome::Authenticated => true,
                    SaslOutcome::ServerRejected(condition) => {
                        warn!(condition, "SASL rejected, falling back to legacy auth");
                        false
                    }
                }
            }
            None => {
                debug!("no compatible SASL mechanism offered, using legacy auth");
                false
            }
        };

        let address = if used_sasl {
            self.bind_and_establish(resource).await?
        } else {
            self.legacy_login(username, password, resource).await?
        };

        self.finish_login(
            &address,
            LoginRequest::Credentials {
                username: username.to_string(),
                password: password.to_string(),
                resource: resource.to_string(),
            },
        );
        Ok(address)
    }

    pub(crate) async fn login_anonymously_locked(&self) -> Result<String> {
        self.ensure_ready_for_login()?;

        let features = self.features.read().clone().unwrap_or_default();
        if !features.mechanisms.iter().any(|m| m == "ANONYMOUS") {
            return Err(StreamEngineError::NotOffered {
                feature: "anonymous login",
            });
        }

        match self
            .sasl_exchange(Box::new(Anonymous), ANONYMOUS_AUTH_TIMEOUT)
            .await?
        {
            SaslOutcome::Authenticated => {}
            SaslOutcome::ServerRejected(condition) => {
                return Err(StreamEngineError::AuthenticationFailed(condition));
            }
        }

        // The server assigns the resource for anonymous sessions
        let address = self.bind_and_establish("").await?;
        self.finish_login(&address, LoginRequest::Anonymous);
        Ok(address)
    }

    fn ensure_ready_for_login(&self) -> Result<()> {
        if !self.state.is_connected() {
            return Err(StreamEngineError::StateConflict(
                "cannot log in while disconnected".into(),
            ));
        }
        if self.state.is_authenticated() {
            return Err(StreamEngineError::StateConflict(
                "already logged in".into(),
            ));
        }
        Ok(())
    }

    // ---- SASL ----------------------------------------------------------

    async fn sasl_exchange(
        &self,
        mut mechanism: Box<dyn SaslMechanism>,
        timeout: Duration,
    ) -> Result<SaslOutcome> {
        self.state.set(ConnectionState::Authenticating);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.gates.sasl.lock() = Some(tx);
        let result = self.run_sasl_exchange(&mut mechanism, rx, timeout).await;
        *self.gates.sasl.lock() = None;
        result
    }

    async fn run_sasl_exchange(
        &self,
        mechanism: &mut Box<dyn SaslMechanism>,
        mut rx: mpsc::UnboundedReceiver<SaslEvent>,
        timeout: Duration,
    ) -> Result<SaslOutcome> {
        let auth = match mechanism.initial_response()? {
            None => format!(
                "<auth xmlns='{}' mechanism='{}'/>",
                ns::SASL,
                mechanism.name()
            ),
            Some(data) => format!(
                "<auth xmlns='{}' mechanism='{}'>{}</auth>",
                ns::SASL,
                mechanism.name(),
                encode_sasl_payload(&data)
            ),
        };
        self.send_negotiation(auth)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StreamEngineError::timeout("SASL authentication", timeout));
            }

            match tokio::time::timeout(remaining, rx.recv()).await {
                Err(_) => {
                    return Err(StreamEngineError::timeout("SASL authentication", timeout));
                }
                Ok(None) => {
                    return Err(StreamEngineError::IoFailure(
                        "connection lost during authentication".into(),
                    ));
                }
                Ok(Some(SaslEvent::Challenge(data))) => {
                    let response = mechanism.respond(&data)?;
                    self.send_negotiation(format!(
                        "<response xmlns='{}'>{}</response>",
                        ns::SASL,
                        encode_sasl_payload(&response)
                    ))?;
                }
                Ok(Some(SaslEvent::Success(data))) => {
                    mechanism.verify_success(&data)?;
                    debug!(mechanism = mechanism.name(), "SASL negotiation complete");
                    return Ok(SaslOutcome::Authenticated);
                }
                Ok(Some(SaslEvent::Failure(condition))) => {
                    return Ok(SaslOutcome::ServerRejected(condition));
                }
            }
        }
    }

    /// After `<success/>` the stream restarts: send a fresh header and
    /// wait for the post-authentication feature round.
    async fn post_auth_reset(&self) -> Result<StreamFeatures> {
        let (tx, rx) = oneshot::channel();
        *self.gates.features.lock() = Some(tx);

        self.send_negotiation(framing::stream_open(&self.config.service_name))?;

        let bound = self.config.reply_timeout * 3;
        match tokio::time::timeout(bound, rx).await {
            Err(_) => {
                *self.gates.features.lock() = None;
                Err(StreamEngineError::timeout("stream restart", bound))
            }
            Ok(Err(_)) => Err(StreamEngineError::IoFailure(
                "connection lost during stream restart".into(),
            )),
            Ok(Ok(features)) => Ok(features),
        }
    }

    // ---- binding and session -------------------------------------------

    async fn bind_and_establish(&self, resource: &str) -> Result<String> {
        let features = self.post_auth_reset().await?;

        if !features.bind {
            return Err(StreamEngineError::NotOffered {
                feature: "resource binding",
            });
        }
        self.state.set(ConnectionState::ResourceBinding);
        let address = self.bind_resource(resource).await?;

        // Session establishment only happens when offered; absence is
        // not an error.
        if features.session {
            self.state.set(ConnectionState::SessionEstablishing);
            self.establish_session().await?;
        }

        Ok(address)
    }

    /// Request the desired resource; the server may override it. Returns
    /// the bound full address from the reply.
    async fn bind_resource(&self, resource: &str) -> Result<String> {
        let id = self.fresh_id();
        let rx = self.pending_iq.register(&id);

        let payload = if resource.is_empty() {
            format!("<bind xmlns='{}'/>", ns::BIND)
        } else {
            format!(
                "<bind xmlns='{}'><resource>{}</resource></bind>",
                ns::BIND,
                escape_text(resource)
            )
        };
        self.send(Stanza::build(
            StanzaKind::Iq,
            Some(&id),
            None,
            Some("set"),
            &payload,
        ))?;

        let reply = self.await_reply(rx, &id, BIND_TIMEOUT, "resource binding").await?;
        if reply.is_error() {
            let condition = reply
                .error
                .map(|e| e.condition)
                .unwrap_or_else(|| "undefined-condition".into());
            return Err(StreamEngineError::ProtocolFailure(format!(
                "resource binding failed: {condition}"
            )));
        }

        let jid = framing::child_text(reply.as_xml(), "jid")
            .filter(|j| !j.is_empty())
            .ok_or_else(|| {
                StreamEngineError::ProtocolFailure("bind result carried no address".into())
            })?;
        *self.bound_address.write() = Some(jid.clone());
        debug!(address = %jid, "resource bound");
        Ok(jid)
    }

    async fn establish_session(&self) -> Result<()> {
        let id = self.fresh_id();
        let rx = self.pending_iq.register(&id);

        self.send(Stanza::build(
            StanzaKind::Iq,
            Some(&id),
            None,
            Some("set"),
            &format!("<session xmlns='{}'/>", ns::SESSION),
        ))?;

        let reply = self
            .await_reply(rx, &id, SESSION_TIMEOUT, "session establishment")
            .await?;
        if reply.is_error() {
            let condition = reply
                .error
                .map(|e| e.condition)
                .unwrap_or_else(|| "undefined-condition".into());
            return Err(StreamEngineError::ProtocolFailure(format!(
                "session establishment failed: {condition}"
            )));
        }
        Ok(())
    }

    // ---- legacy auth ---------------------------------------------------

    /// Pre-SASL `jabber:iq:auth` handshake: probe which credential forms
    /// the server accepts, then authenticate with digest when possible
    /// and plaintext otherwise.
    async fn legacy_login(
        &self,
        username: &str,
        password: &str,
        resource: &str,
    ) -> Result<String> {
        self.state.set(ConnectionState::Authenticating);

        let probe_id = self.fresh_id();
        let rx = self.pending_iq.register(&probe_id);
        self.send(Stanza::build(
            StanzaKind::Iq,
            Some(&probe_id),
            Some(&self.config.service_name),
            Some("get"),
            &format!(
                "<query xmlns='{}'><username>{}</username></query>",
                ns::AUTH_LEGACY,
                escape_text(username)
            ),
        ))?;

        let offer = self
            .await_reply(rx, &probe_id, AUTH_TIMEOUT, "legacy auth discovery")
            .await?;
        if offer.is_error() {
            return Err(StreamEngineError::AuthenticationFailed(
                "server does not support legacy authentication".into(),
            ));
        }

        let stream_id = self.stream_header.read().as_ref().and_then(|h| h.id.clone());
        let credential = match (framing::has_child(offer.as_xml(), "digest"), stream_id) {
            (true, Some(stream_id)) => {
                debug!("legacy auth using digest credentials");
                format!("<digest>{}</digest>", legacy_digest(&stream_id, password))
            }
            _ => {
                debug!("legacy auth using plaintext credentials");
                format!("<password>{}</password>", escape_text(password))
            }
        };

        let auth_id = self.fresh_id();
        let rx = self.pending_iq.register(&auth_id);
        self.send(Stanza::build(
            StanzaKind::Iq,
            Some(&auth_id),
            Some(&self.config.service_name),
            Some("set"),
            &format!(
                "<query xmlns='{}'><username>{}</username>{}<resource>{}</resource></query>",
                ns::AUTH_LEGACY,
                escape_text(username),
                credential,
                escape_text(resource)
            ),
        ))?;

        let reply = self
            .await_reply(rx, &auth_id, AUTH_TIMEOUT, "legacy authentication")
            .await?;
        if reply.is_error() {
            let condition = reply
                .error
                .map(|e| e.condition)
                .unwrap_or_else(|| "not-authorized".into());
            return Err(StreamEngineError::AuthenticationFailed(condition));
        }

        // Legacy servers have no bind step; the address is what we asked
        // for.
        let address = format!("{}@{}/{}", username, self.config.service_name, resource);
        *self.bound_address.write() = Some(address.clone());
        Ok(address)
    }

    // ---- shared tail ---------------------------------------------------

    fn finish_login(&self, address: &str, request: LoginRequest) {
        *self.last_login.write() = Some(request);
        self.was_authenticated.store(true, Ordering::Release);
        self.state.set(ConnectionState::Authenticated);

        // Announce availability; failure here is not a login failure
        if let Err(e) = self.send(Stanza::presence_available()) {
            warn!(error = %e, "could not send initial presence");
        }

        info!(address, "logged in");
        self.notify_event(&crate::listener::ConnectionEvent::Authenticated {
            address: address.to_string(),
        });
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<Stanza>,
        id: &str,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<Stanza> {
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.pending_iq.forget(id);
                Err(StreamEngineError::timeout(operation, timeout))
            }
            Ok(Err(_)) => Err(StreamEngineError::IoFailure(format!(
                "connection lost while waiting for {operation}"
            ))),
            Ok(Ok(stanza)) => Ok(stanza),
        }
    }
}

/// Zero-length SASL payloads go on the wire as "="
fn encode_sasl_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        BASE64.encode(data)
    }
}

/// Legacy digest credential: lowercase hex SHA-1 over stream id and
/// password
fn legacy_digest(stream_id: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_digest_is_hex_sha1_of_id_and_password() {
        // sha1("3B8E1AF5" + "secret") computed independently
        let digest = legacy_digest("3B8E1AF5", "secret");
        assert_eq!(digest.len(), 40);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, legacy_digest("3B8E1AF5", "secret"));
        assert_ne!(digest, legacy_digest("3B8E1AF5", "other"));
    }

    #[test]
    fn empty_sasl_payload_encodes_as_equals() {
        assert_eq!(encode_sasl_payload(b""), "=");
        assert_eq!(encode_sasl_payload(b"abc"), "YWJj");
    }
}
