use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Result, StreamEngineError};

type HmacSha256 = Hmac<Sha256>;

/// Credentials handed to mechanism constructors
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Authorization identity, empty for "same as authentication identity"
    pub authzid: Option<String>,
}

/// One pluggable challenge/response authentication mechanism.
///
/// The exchange is driven by the authentication state machine: the
/// initial response goes inside `<auth/>`, every server `<challenge/>`
/// payload is forwarded verbatim to `respond`, and the `<success/>`
/// payload (if any) is handed to `verify_success` so mechanisms that
/// authenticate the server can reject a forged success.
pub trait SaslMechanism: Send {
    /// Mechanism name as advertised in stream features, e.g. "PLAIN"
    fn name(&self) -> &'static str;

    /// Initial response to include in `<auth/>`, if the mechanism is
    /// client-first
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>>;

    /// Compute the response to a decoded server challenge
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// Inspect the decoded additional data carried by `<success/>`
    fn verify_success(&mut self, data: &[u8]) -> Result<()> {
        let _ = data;
        Ok(())
    }
}

/// Constructor closure stored in the registry
pub type MechanismCtor = Box<dyn Fn(&Credentials) -> Box<dyn SaslMechanism> + Send + Sync>;

/// Preference-ordered table of available mechanisms.
///
/// Owned by the connection configuration; there is no process-global
/// mechanism state. Selection picks the first entry the server also
/// advertises.
pub struct MechanismRegistry {
    entries: Vec<(&'static str, MechanismCtor)>,
}

impl MechanismRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registry with the stock credentialed mechanisms, strongest first:
    /// SCRAM-SHA-256, then PLAIN.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("SCRAM-SHA-256", |creds| {
            Box::new(ScramSha256::new(creds.clone()))
        });
        registry.register("PLAIN", |creds| Box::new(Plain::new(creds.clone())));
        registry
    }

    /// Append a mechanism with lowest preference
    pub fn register(
        &mut self,
        name: &'static str,
        ctor: impl Fn(&Credentials) -> Box<dyn SaslMechanism> + Send + Sync + 'static,
    ) {
        self.entries.push((name, Box::new(ctor)));
    }

    /// Insert a mechanism with highest preference
    pub fn register_preferred(
        &mut self,
        name: &'static str,
        ctor: impl Fn(&Credentials) -> Box<dyn SaslMechanism> + Send + Sync + 'static,
    ) {
        self.entries.insert(0, (name, Box::new(ctor)));
    }

    /// First registered mechanism the server advertises, or `None` when
    /// nothing matches (the caller then falls back to legacy auth)
    pub fn select(
        &self,
        advertised: &[String],
        credentials: &Credentials,
    ) -> Option<Box<dyn SaslMechanism>> {
        for (name, ctor) in &self.entries {
            if advertised.iter().any(|m| m == name) {
                return Some(ctor(credentials));
            }
        }
        None
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }
}

/// PLAIN (RFC 4616): authzid NUL authcid NUL password, over TLS only in
/// any sane deployment
pub struct Plain {
    credentials: Credentials,
}

impl Plain {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        let authzid = self.credentials.authzid.as_deref().unwrap_or("");
        let mut out = Vec::new();
        out.extend_from_slice(authzid.as_bytes());
        out.push(0);
        out.extend_from_slice(self.credentials.username.as_bytes());
        out.push(0);
        out.extend_from_slice(self.credentials.password.as_bytes());
        Ok(Some(out))
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Err(StreamEngineError::AuthenticationFailed(
            "PLAIN received an unexpected challenge".into(),
        ))
    }
}

/// ANONYMOUS (RFC 4505): no credentials, server assigns an identity
pub struct Anonymous;

impl SaslMechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// EXTERNAL (RFC 4422): authentication already established by the lower
/// layer, typically a TLS client certificate
pub struct External {
    authzid: Option<String>,
}

impl External {
    pub fn new(authzid: Option<String>) -> Self {
        Self { authzid }
    }
}

impl SaslMechanism for External {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(Some(
            self.authzid.as_deref().unwrap_or("").as_bytes().to_vec(),
        ))
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

enum ScramState {
    Initial,
    SentClientFirst { client_first_bare: String },
    SentClientFinal { server_signature: Vec<u8> },
    Done,
}

/// SCRAM-SHA-256 (RFC 7677), without channel binding ("n,,").
///
/// Verifies the server signature from `<success/>`, so a server that
/// does not know the password cannot fake a successful login.
pub struct ScramSha256 {
    credentials: Credentials,
    client_nonce: String,
    state: ScramState,
}

impl ScramSha256 {
    pub fn new(credentials: Credentials) -> Self {
        let client_nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_nonce(credentials, client_nonce)
    }

    fn with_nonce(credentials: Credentials, client_nonce: String) -> Self {
        Self {
            credentials,
            client_nonce,
            state: ScramState::Initial,
        }
    }
}

impl SaslMechanism for ScramSha256 {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-256"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        let client_first_bare = format!(
            "n={},r={}",
            saslname_escape(&self.credentials.username),
            self.client_nonce
        );
        let message = format!("n,,{client_first_bare}");
        self.state = ScramState::SentClientFirst { client_first_bare };
        Ok(Some(message.into_bytes()))
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let client_first_bare = match &self.state {
            ScramState::SentClientFirst { client_first_bare } => client_first_bare.clone(),
            _ => {
                return Err(StreamEngineError::AuthenticationFailed(
                    "SCRAM challenge out of sequence".into(),
                ))
            }
        };

        let server_first = String::from_utf8_lossy(challenge).into_owned();
        let nonce = scram_field(&server_first, 'r')?;
        let salt_b64 = scram_field(&server_first, 's')?;
        let iterations: u32 = scram_field(&server_first, 'i')?
            .parse()
            .map_err(|_| scram_error("bad iteration count"))?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err(scram_error("server nonce does not extend client nonce"));
        }
        let salt = BASE64
            .decode(salt_b64.as_bytes())
            .map_err(|_| scram_error("bad salt encoding"))?;

        let salted_password = hi(self.credentials.password.as_bytes(), &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);

        let without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
        self.state = ScramState::SentClientFinal { server_signature };

        Ok(format!("{without_proof},p={}", BASE64.encode(client_proof)).into_bytes())
    }

    fn verify_success(&mut self, data: &[u8]) -> Result<()> {
        let expected = match &self.state {
            ScramState::SentClientFinal { server_signature } => server_signature.clone(),
            _ => return Err(scram_error("success out of sequence")),
        };
        let server_final = String::from_utf8_lossy(data).into_owned();
        let verifier = scram_field(&server_final, 'v')?;
        let signature = BASE64
            .decode(verifier.as_bytes())
            .map_err(|_| scram_error("bad server signature encoding"))?;
        if signature != expected {
            return Err(scram_error("server signature mismatch"));
        }
        self.state = ScramState::Done;
        Ok(())
    }
}

/// Hi() from RFC 5802: PBKDF2 with HMAC-SHA-256 as the PRF
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac_sha256(password, &block);
    let mut result = u.clone();
    for _ in 1..iterations {
        u = hmac_sha256(password, &u);
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    result
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Extract `<name>=<value>` from a comma-separated SCRAM message
fn scram_field(message: &str, name: char) -> Result<String> {
    message
        .split(',')
        .find_map(|part| part.strip_prefix(&format!("{name}=")))
        .map(str::to_string)
        .ok_or_else(|| scram_error(&format!("missing {name}= field")))
}

fn scram_error(reason: &str) -> StreamEngineError {
    StreamEngineError::AuthenticationFailed(format!("SCRAM: {reason}"))
}

/// Escape "," and "=" in a saslname (RFC 5802 section 5.1)
fn saslname_escape(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_initial_response_is_nul_separated() {
        let mut mechanism = Plain::new(Credentials {
            username: "user".into(),
            password: "pencil".into(),
            authzid: None,
        });
        let response = mechanism.initial_response().unwrap().unwrap();
        assert_eq!(response, b"\0user\0pencil");
    }

    #[test]
    fn registry_selects_by_preference_order() {
        let registry = MechanismRegistry::with_defaults();
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
            authzid: None,
        };

        let advertised = vec!["PLAIN".to_string(), "SCRAM-SHA-256".to_string()];
        let mechanism = registry.select(&advertised, &creds).unwrap();
        assert_eq!(mechanism.name(), "SCRAM-SHA-256");

        let plain_only = vec!["PLAIN".to_string()];
        let mechanism = registry.select(&plain_only, &creds).unwrap();
        assert_eq!(mechanism.name(), "PLAIN");

        assert!(registry.select(&["DIGEST-MD5".to_string()], &creds).is_none());
    }

    /// RFC 7677 section 3 test vector
    #[test]
    fn scram_sha256_rfc7677_vector() {
        let creds = Credentials {
            username: "user".into(),
            password: "pencil".into(),
            authzid: None,
        };
        let mut scram = ScramSha256::with_nonce(creds, "rOprNGfwEbeRWgbNEkqO".into());

        let first = scram.initial_response().unwrap().unwrap();
        assert_eq!(first, b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec());

        let server_first = "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
                            s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let client_final = scram.respond(server_first.as_bytes()).unwrap();
        assert_eq!(
            String::from_utf8(client_final).unwrap(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        let server_final = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";
        scram.verify_success(server_final.as_bytes()).unwrap();
    }

    #[test]
    fn scram_rejects_forged_server_signature() {
        let creds = Credentials {
            username: "user".into(),
            password: "pencil".into(),
            authzid: None,
        };
        let mut scram = ScramSha256::with_nonce(creds, "rOprNGfwEbeRWgbNEkqO".into());
        scram.initial_response().unwrap();
        scram
            .respond(
                "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
                 s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096"
                    .as_bytes(),
            )
            .unwrap();
        assert!(scram
            .verify_success(b"v=AAAATRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .is_err());
    }

    #[test]
    fn saslname_escaping() {
        assert_eq!(saslname_escape("a=b,c"), "a=3Db=2Cc");
    }
}
