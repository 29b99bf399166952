//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677)
//!
//! Postgres takes the user name from the startup packet, so the client-first
//! message carries an empty `n=` attribute. Channel binding is not offered.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name announced by the server
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header for "no channel binding"
const GS2_HEADER: &str = "n,,";

/// SCRAM exchange failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScramError {
    #[error("invalid server message: {0}")]
    InvalidServerMessage(String),

    #[error("server signature verification failed")]
    InvalidServerSignature,

    #[error("server reported error: {0}")]
    ServerError(String),

    #[error("base64 error: {0}")]
    Base64(String),

    #[error("key derivation failed: {0}")]
    Crypto(String),
}

/// Values carried from the client-final step to server-final verification
#[derive(Clone, Debug)]
pub struct ScramState {
    auth_message: String,
    server_key: [u8; 32],
}

/// One SCRAM-SHA-256 exchange
pub struct ScramClient {
    password: String,
    nonce: String,
}

impl ScramClient {
    /// Start an exchange with a random nonce
    pub fn new(password: impl Into<String>) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(password: impl Into<String>, nonce: String) -> Self {
        Self {
            password: password.into(),
            nonce,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.nonce)
    }

    /// Client-first message
    pub fn client_first(&self) -> String {
        format!("{}{}", GS2_HEADER, self.client_first_bare())
    }

    /// Answer the server-first challenge
    pub fn client_final(&self, server_first: &str) -> Result<(String, ScramState), ScramError> {
        let challenge = ServerFirst::parse(server_first)?;
        if !challenge.nonce.starts_with(&self.nonce) || challenge.nonce.len() == self.nonce.len() {
            return Err(ScramError::InvalidServerMessage(
                "server nonce does not extend client nonce".into(),
            ));
        }

        let salted = salted_password(&self.password, &challenge.salt, challenge.iterations);
        let client_key = hmac(&salted, b"Client Key")?;
        let server_key = hmac(&salted, b"Server Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={},r={}", BASE64.encode(GS2_HEADER), challenge.nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let message = format!("{},p={}", without_proof, BASE64.encode(proof));
        Ok((
            message,
            ScramState {
                auth_message,
                server_key,
            },
        ))
    }

    /// Check the server's signature in the server-final message
    pub fn verify_server_final(
        &self,
        server_final: &str,
        state: &ScramState,
    ) -> Result<(), ScramError> {
        if let Some(reason) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerError(reason.to_string()));
        }
        let encoded = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| ScramError::InvalidServerMessage("missing server signature".into()))?;
        let received = BASE64
            .decode(encoded)
            .map_err(|e| ScramError::Base64(e.to_string()))?;

        let expected = hmac(&state.server_key, state.auth_message.as_bytes())?;
        if constant_time_eq(&received, &expected) {
            Ok(())
        } else {
            Err(ScramError::InvalidServerSignature)
        }
    }
}

impl std::fmt::Debug for ScramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramClient")
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

/// Parsed `r=...,s=...,i=...`
struct ServerFirst {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl ServerFirst {
    fn parse(msg: &str) -> Result<Self, ScramError> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in msg.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(v).map_err(|e| ScramError::Base64(e.to_string()))?);
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = Some(v.parse::<u32>().map_err(|_| {
                    ScramError::InvalidServerMessage(format!("invalid iteration count '{}'", v))
                })?);
            } else if part.starts_with("m=") {
                return Err(ScramError::InvalidServerMessage(
                    "mandatory extensions are not supported".into(),
                ));
            }
        }

        match (nonce, salt, iterations) {
            (Some(nonce), Some(salt), Some(iterations)) if iterations > 0 => Ok(Self {
                nonce,
                salt,
                iterations,
            }),
            _ => Err(ScramError::InvalidServerMessage(
                "missing required fields in server first message".into(),
            )),
        }
    }
}

fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    // Only fails on an invalid output length, which is fixed here
    let _ = pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ScramError::Crypto(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 section 3 test vector, with the user name moved to the
    // startup packet as Postgres does
    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    fn client() -> ScramClient {
        ScramClient::with_nonce("pencil", CLIENT_NONCE.to_string())
    }

    #[test]
    fn test_client_first_has_empty_user() {
        assert_eq!(client().client_first(), "n,,n=,r=rOprNGfwEbeRWgbNEkqO");
    }

    #[test]
    fn test_random_nonce_differs() {
        assert_ne!(ScramClient::new("a").nonce, ScramClient::new("a").nonce);
    }

    #[test]
    fn test_client_final_round_trip_with_server() {
        let client = client();
        let (message, state) = client.client_final(SERVER_FIRST).unwrap();
        assert!(message.starts_with("c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p="));

        // Compute the server side independently to produce a valid server-final
        let salt = BASE64.decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
        let salted = salted_password("pencil", &salt, 4096);
        let server_key = hmac(&salted, b"Server Key").unwrap();
        let signature = hmac(&server_key, state.auth_message.as_bytes()).unwrap();
        let server_final = format!("v={}", BASE64.encode(signature));

        client.verify_server_final(&server_final, &state).unwrap();
    }

    #[test]
    fn test_rejects_tampered_signature() {
        let client = client();
        let (_, state) = client.client_final(SERVER_FIRST).unwrap();
        let bogus = format!("v={}", BASE64.encode([0u8; 32]));
        assert_eq!(
            client.verify_server_final(&bogus, &state),
            Err(ScramError::InvalidServerSignature)
        );
    }

    #[test]
    fn test_server_error_attribute() {
        let client = client();
        let (_, state) = client.client_final(SERVER_FIRST).unwrap();
        assert_eq!(
            client.verify_server_final("e=invalid-proof", &state),
            Err(ScramError::ServerError("invalid-proof".into()))
        );
    }

    #[test]
    fn test_rejects_foreign_nonce() {
        let err = client()
            .client_final("r=someoneelse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap_err();
        assert!(matches!(err, ScramError::InvalidServerMessage(_)));
    }

    #[test]
    fn test_rejects_incomplete_challenge() {
        assert!(client().client_final("r=rOprNGfwEbeRWgbNEkqOxyz,i=4096").is_err());
        assert!(client()
            .client_final("r=rOprNGfwEbeRWgbNEkqOxyz,s=W22Z,i=lots")
            .is_err());
    }
}
