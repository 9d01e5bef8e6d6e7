//! Capability token minting and verification.
//!
//! The controller holds a single Ed25519 key pair. [`Signer::issue`] mints a
//! compact JWS token with claims `{sub, sid, aud="ws", jti, iat, exp}` and a
//! fresh `jti` each time; the public half is published as a JWKS document.
//! The gateway never sees the private key: it builds a [`KeySet`] from the
//! published JWKS and verifies signatures locally.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Audience claim stamped into every capability token.
pub const TOKEN_AUDIENCE: &str = "ws";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("failed to load signing key: {0}")]
    KeyLoad(String),

    #[error("failed to sign token: {0}")]
    Sign(String),

    #[error("token expired")]
    Expired,

    #[error("token audience mismatch")]
    Audience,

    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Claim set carried by a capability token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Owner identity the session was created for.
    pub sub: String,
    /// Session the token is bound to.
    pub sid: String,
    /// Always [`TOKEN_AUDIENCE`].
    pub aud: String,
    /// One-shot token id; the durable replay guard keys on this.
    pub jti: String,
    /// Issued-at, seconds since epoch.
    pub iat: u64,
    /// Expiry, seconds since epoch.
    pub exp: u64,
}

/// A freshly minted token plus the metadata the controller must persist
/// before handing the token to the caller.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Single JWK entry in the published key set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub public_key_use: String,
    pub kid: String,
    /// base64url-encoded Ed25519 public key bytes.
    pub x: String,
}

/// JWKS document served at `/.well-known/jwks.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

/// Holds the private signing key. Created once at startup and shared as an
/// immutable handle; the key never leaves process memory.
pub struct Signer {
    encoding: EncodingKey,
    verifying: VerifyingKey,
    kid: String,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("encoding", &"<redacted>")
            .field("verifying", &self.verifying)
            .field("kid", &self.kid)
            .finish()
    }
}

impl Signer {
    /// Generates a fresh ephemeral key pair.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::from_signing_key(&signing).expect("freshly generated key is always encodable")
    }

    /// Loads a PKCS#8 PEM-encoded Ed25519 private key.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, SignerError> {
        let signing =
            SigningKey::from_pkcs8_pem(pem).map_err(|e| SignerError::KeyLoad(e.to_string()))?;
        Self::from_signing_key(&signing)
    }

    /// Loads the key from `path` when given, otherwise generates an
    /// ephemeral pair and warns. An ephemeral key is fine for a single
    /// replica; multiple controller replicas must share a key file or the
    /// gateway will reject tokens minted by the other replicas.
    pub fn load_or_generate(path: Option<&Path>) -> Result<Self, SignerError> {
        match path {
            Some(path) => {
                let pem = std::fs::read_to_string(path).map_err(|e| {
                    SignerError::KeyLoad(format!("{}: {}", path.display(), e))
                })?;
                Self::from_pkcs8_pem(&pem)
            }
            None => {
                tracing::warn!("no signing key configured, generating an ephemeral key pair");
                Ok(Self::generate())
            }
        }
    }

    fn from_signing_key(signing: &SigningKey) -> Result<Self, SignerError> {
        let der = signing
            .to_pkcs8_der()
            .map_err(|e| SignerError::KeyLoad(e.to_string()))?;
        let verifying = signing.verifying_key();
        let kid = URL_SAFE_NO_PAD.encode(&verifying.to_bytes()[..8]);
        Ok(Self {
            encoding: EncodingKey::from_ed_der(der.as_bytes()),
            verifying,
            kid,
        })
    }

    /// Stable key id for the process lifetime.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Serializes the private key as PKCS#8 PEM. Used to persist a
    /// generated key so replicas can share it.
    pub fn to_pkcs8_pem(signing: &SigningKey) -> Result<String, SignerError> {
        signing
            .to_pkcs8_pem(pkcs8::LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| SignerError::KeyLoad(e.to_string()))
    }

    /// Mints a token for `session_id` owned by `owner_id`, expiring `ttl`
    /// from now.
    pub fn issue(
        &self,
        session_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<IssuedToken, SignerError> {
        self.issue_at(session_id, owner_id, Utc::now(), ttl)
    }

    /// Mints a token with an explicit issue instant. The clock is injectable
    /// so expiry behaviour can be exercised without sleeping.
    pub fn issue_at(
        &self,
        session_id: &str,
        owner_id: &str,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<IssuedToken, SignerError> {
        let expires_at = issued_at
            + chrono::Duration::from_std(ttl)
                .map_err(|e| SignerError::Sign(e.to_string()))?;
        let claims = Claims {
            sub: owner_id.to_string(),
            sid: session_id.to_string(),
            aud: TOKEN_AUDIENCE.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat: issued_at.timestamp() as u64,
            exp: expires_at.timestamp() as u64,
        };
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());
        let token = encode(&header, &claims, &self.encoding)
            .map_err(|e| SignerError::Sign(e.to_string()))?;
        Ok(IssuedToken {
            token,
            token_id: claims.jti,
            expires_at,
        })
    }

    /// The JWKS document for the current key.
    pub fn jwks(&self) -> JwksDocument {
        JwksDocument {
            keys: vec![Jwk {
                kty: "OKP".to_string(),
                crv: "Ed25519".to_string(),
                alg: "EdDSA".to_string(),
                public_key_use: "sig".to_string(),
                kid: self.kid.clone(),
                x: URL_SAFE_NO_PAD.encode(self.verifying.to_bytes()),
            }],
        }
    }

    /// A [`KeySet`] over this signer's public key, for in-process
    /// verification in tests and single-binary deployments.
    pub fn keyset(&self) -> KeySet {
        KeySet::from_jwks(&self.jwks()).expect("own JWKS is always well-formed")
    }
}

/// Verification-side view of the published keys.
#[derive(Clone)]
pub struct KeySet {
    keys: Vec<(String, DecodingKey)>,
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySet")
            .field("kids", &self.keys.iter().map(|(kid, _)| kid.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl KeySet {
    /// Builds a key set from a JWKS document, skipping entries with an
    /// unsupported key type.
    pub fn from_jwks(doc: &JwksDocument) -> Result<Self, SignerError> {
        let mut keys = Vec::new();
        for jwk in &doc.keys {
            if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
                tracing::debug!(kid = %jwk.kid, kty = %jwk.kty, "skipping unsupported JWKS entry");
                continue;
            }
            let key = DecodingKey::from_ed_components(&jwk.x)
                .map_err(|e| SignerError::Invalid(format!("bad JWKS entry {}: {}", jwk.kid, e)))?;
            keys.push((jwk.kid.clone(), key));
        }
        if keys.is_empty() {
            return Err(SignerError::Invalid("JWKS contains no usable keys".into()));
        }
        Ok(Self { keys })
    }

    /// Verifies signature, expiry (no leeway), and audience, returning the
    /// claim set. The header `kid` selects the key when it matches;
    /// otherwise every key is tried so that a rotated-but-republished key
    /// still verifies.
    pub fn verify(&self, token: &str) -> Result<Claims, SignerError> {
        let header =
            decode_header(token).map_err(|e| SignerError::Invalid(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_audience(&[TOKEN_AUDIENCE]);
        validation.leeway = 0;

        let candidates: Vec<&DecodingKey> = match header.kid.as_deref() {
            Some(kid) => {
                let matched: Vec<_> = self
                    .keys
                    .iter()
                    .filter(|(k, _)| k == kid)
                    .map(|(_, key)| key)
                    .collect();
                if matched.is_empty() {
                    self.keys.iter().map(|(_, key)| key).collect()
                } else {
                    matched
                }
            }
            None => self.keys.iter().map(|(_, key)| key).collect(),
        };

        let mut last_err = SignerError::Invalid("no keys attempted".into());
        for key in candidates {
            match decode::<Claims>(token, key, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(e) => {
                    last_err = match e.kind() {
                        jsonwebtoken::errors::ErrorKind::ExpiredSignature => SignerError::Expired,
                        jsonwebtoken::errors::ErrorKind::InvalidAudience => SignerError::Audience,
                        _ => SignerError::Invalid(e.to_string()),
                    };
                    // Expiry and audience failures are definitive regardless
                    // of which key signed the token.
                    if matches!(last_err, SignerError::Expired | SignerError::Audience) {
                        return Err(last_err);
                    }
                }
            }
        }
        Err(last_err)
    }
}
