//! SCRAM-SHA-256 client side of SASL authentication (RFC 5802, RFC 7677).
//!
//! No channel binding: the GS2 header is always `n,,`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;
type Key = [u8; 32];

pub const MECHANISM: &str = "SCRAM-SHA-256";

const GS2_HEADER: &str = "n,,";
/// base64("n,,")
const CHANNEL_BINDING: &str = "biws";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("malformed server message: {0}")]
    Malformed(&'static str),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server signature mismatch")]
    SignatureMismatch,
    #[error("server rejected authentication: {0}")]
    Rejected(String),
    #[error("message out of order")]
    OutOfOrder,
}

impl From<ScramError> for Error {
    fn from(e: ScramError) -> Self {
        Error::Auth(format!("{}: {}", MECHANISM, e))
    }
}

enum Stage {
    Started,
    /// Client proof sent; holds the signature the server must answer with.
    Proved { server_signature: Key },
}

pub struct ScramClient {
    password: String,
    nonce: String,
    client_first_bare: String,
    stage: Stage,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let raw: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, BASE64.encode(raw))
    }

    fn with_nonce(username: &str, password: &str, nonce: String) -> Self {
        // Postgres authenticates the startup user and ignores this name,
        // only the attribute separators need escaping.
        let name = username.replace('=', "=3D").replace(',', "=2C");
        Self {
            password: password.to_string(),
            client_first_bare: format!("n={},r={}", name, nonce),
            nonce,
            stage: Stage::Started,
        }
    }

    /// `n,,n=<user>,r=<nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("{}{}", GS2_HEADER, self.client_first_bare).into_bytes()
    }

    /// Answer `r=<nonce>,s=<salt>,i=<iterations>` with the client-final
    /// message carrying the proof.
    pub fn process_server_first(&mut self, message: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.stage, Stage::Started) {
            return Err(ScramError::OutOfOrder);
        }
        let server_first = utf8(message)?;
        let challenge = Challenge::parse(server_first)?;
        if challenge.nonce.len() <= self.nonce.len() || !challenge.nonce.starts_with(&self.nonce)
        {
            return Err(ScramError::NonceMismatch);
        }

        let salted = salted_password(&self.password, &challenge.salt, challenge.iterations)?;
        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key: Key = Sha256::digest(client_key).into();

        let without_proof = format!("c={},r={}", CHANNEL_BINDING, challenge.nonce);
        let auth_message = [
            self.client_first_bare.as_str(),
            server_first,
            without_proof.as_str(),
        ]
        .join(",");

        let mut proof = hmac(&stored_key, auth_message.as_bytes())?;
        proof.iter_mut().zip(client_key).for_each(|(p, k)| *p ^= k);

        let server_key = hmac(&salted, b"Server Key")?;
        self.stage = Stage::Proved {
            server_signature: hmac(&server_key, auth_message.as_bytes())?,
        };

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check `v=<signature>` from the server (or surface its `e=<error>`).
    pub fn verify_server_final(&self, message: &[u8]) -> Result<(), ScramError> {
        let Stage::Proved { server_signature } = &self.stage else {
            return Err(ScramError::OutOfOrder);
        };
        let text = utf8(message)?;
        if let Some(reason) = text.strip_prefix("e=") {
            return Err(ScramError::Rejected(reason.to_string()));
        }
        let verifier = text
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or(ScramError::Malformed("missing verifier"))?;
        let received = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::Malformed("verifier is not base64"))?;
        if received.as_slice() != server_signature.as_slice() {
            return Err(ScramError::SignatureMismatch);
        }
        Ok(())
    }
}

/// Parsed server-first-message.
struct Challenge<'a> {
    nonce: &'a str,
    salt: Vec<u8>,
    iterations: u32,
}

impl<'a> Challenge<'a> {
    fn parse(text: &'a str) -> Result<Self, ScramError> {
        let (mut nonce, mut salt, mut iterations) = (None, None, None);
        for attr in text.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => {
                    salt = Some(
                        BASE64
                            .decode(v)
                            .map_err(|_| ScramError::Malformed("salt is not base64"))?,
                    )
                }
                Some(("i", v)) => {
                    iterations = Some(
                        v.parse::<u32>()
                            .ok()
                            .filter(|n| *n > 0)
                            .ok_or(ScramError::Malformed("bad iteration count"))?,
                    )
                }
                Some(("m", _)) => return Err(ScramError::Malformed("unsupported extension")),
                _ => {}
            }
        }
        Ok(Self {
            nonce: nonce.ok_or(ScramError::Malformed("missing nonce"))?,
            salt: salt.ok_or(ScramError::Malformed("missing salt"))?,
            iterations: iterations.ok_or(ScramError::Malformed("missing iteration count"))?,
        })
    }
}

fn utf8(message: &[u8]) -> Result<&str, ScramError> {
    std::str::from_utf8(message).map_err(|_| ScramError::Malformed("not UTF-8"))
}

/// Hi(password, salt, i)
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> Result<Key, ScramError> {
    let mut key = Key::default();
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut key)
        .map_err(|_| ScramError::Malformed("bad salt"))?;
    Ok(key)
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Key, ScramError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| ScramError::Malformed("bad key length"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
