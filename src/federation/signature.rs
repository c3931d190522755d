//! HTTP Signatures
//!
//! Outbound requests are signed in the `hs2019` form with `(created)` and
//! `(expires)` pseudo-headers. Verification accepts that form as well as the
//! classic `date`-header form used by most servers.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Lifetime of an outbound signature.
pub const SIGNATURE_TTL_SECONDS: i64 = 3600;

/// Allowed clock skew for `date` and `(created)`.
const CLOCK_SKEW_SECONDS: i64 = 300;

/// Real headers never included in the signing string.
const UNSIGNED_HEADERS: [&str; 4] = ["user-agent", "accept-encoding", "content-type", "accept"];

/// Headers to add to a signed request, in signing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub host: String,
    pub date: String,
    pub digest: Option<String>,
    pub signature: String,
}

/// Build the signing string and the ordered list of signed header names.
///
/// `headers` are the real request headers; excluded names are skipped and
/// the rest are rendered as `lowercase-name: value`.
pub fn signing_string(
    method: &str,
    path_and_query: &str,
    created: i64,
    expires: i64,
    headers: &[(&str, &str)],
) -> (String, Vec<String>) {
    let mut lines = vec![
        format!(
            "(request-target): {} {}",
            method.to_ascii_lowercase(),
            path_and_query
        ),
        format!("(created): {}", created),
        format!("(expires): {}", expires),
    ];
    let mut names = vec![
        "(request-target)".to_string(),
        "(created)".to_string(),
        "(expires)".to_string(),
    ];

    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        if UNSIGNED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        lines.push(format!("{}: {}", name, value.trim()));
        names.push(name);
    }

    (lines.join("\n"), names)
}

/// Sign a request at the instant `now`.
///
/// The output is a pure function of its inputs, so the same key, request
/// and timestamp always produce the same headers.
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<SignedHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = match (parsed_url.host_str(), parsed_url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(AppError::Validation("Missing host in URL".to_string())),
    };

    let path_and_query = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);
    let created = now.timestamp();
    let expires = created + SIGNATURE_TTL_SECONDS;

    let mut headers: Vec<(&str, &str)> = vec![("host", host.as_str()), ("date", date.as_str())];
    if let Some(digest) = digest.as_deref() {
        headers.push(("digest", digest));
    }

    let (signing_string, names) = signing_string(method, &path_and_query, created, expires, &headers);
    let signature_b64 = sign_string(private_key_pem, &signing_string)?;

    let signature = format!(
        "keyId=\"{}\",algorithm=\"hs2019\",headers=\"{}\",signature=\"{}\",created={},expires={}",
        key_id,
        names.join(" "),
        signature_b64,
        created,
        expires
    );

    Ok(SignedHeaders {
        host,
        date,
        digest,
        signature,
    })
}

/// RSA-SHA256 (PKCS#1 v1.5) over `input`, base64-encoded.
pub fn sign_string(private_key_pem: &str, input: &str) -> Result<String, AppError> {
    let private_key = parse_private_key(private_key_pem)?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let signature = signing_key.sign(input.as_bytes());
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Verify an inbound request signature at the instant `now`.
pub fn verify_signature(
    method: &str,
    path_and_query: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let signature_header = header_str(headers, "signature")?;
    let parsed = parse_signature_header(signature_header)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Validation(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    if !parsed.headers.iter().any(|h| h == "(request-target)") {
        return Err(AppError::Validation(
            "Signed headers must include: (request-target)".to_string(),
        ));
    }

    let signs_created = parsed.headers.iter().any(|h| h == "(created)");
    let signs_date = parsed.headers.iter().any(|h| h == "date");

    if signs_created {
        let created = parsed
            .created
            .ok_or_else(|| AppError::Validation("Missing created parameter".to_string()))?;
        if created > now.timestamp() + CLOCK_SKEW_SECONDS {
            return Err(AppError::Validation("Signature created in the future".to_string()));
        }
        if let Some(expires) = parsed.expires {
            if expires < now.timestamp() {
                return Err(AppError::Validation("Signature expired".to_string()));
            }
        }
    } else if signs_date {
        let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
            .map_err(|_| AppError::Validation("Invalid Date format".to_string()))?;
        if (now.timestamp() - date.timestamp()).abs() > CLOCK_SKEW_SECONDS {
            return Err(AppError::Validation(
                "Date header too old or in future".to_string(),
            ));
        }
    } else {
        return Err(AppError::Validation(
            "Signed headers must include (created) or date".to_string(),
        ));
    }

    if let Some(body) = body {
        if !parsed.headers.iter().any(|h| h == "digest") {
            return Err(AppError::Validation(
                "Signed headers must include: digest".to_string(),
            ));
        }
        if header_str(headers, "digest")? != generate_digest(body) {
            return Err(AppError::Validation("Digest mismatch".to_string()));
        }
    }

    let mut lines = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let value = match name.as_str() {
            "(request-target)" => format!("{} {}", method.to_ascii_lowercase(), path_and_query),
            "(created)" => parsed.created.map(|c| c.to_string()).unwrap_or_default(),
            "(expires)" => parsed
                .expires
                .map(|e| e.to_string())
                .ok_or_else(|| AppError::Validation("Missing expires parameter".to_string()))?,
            other => header_str(headers, other)?.trim().to_string(),
        };
        lines.push(format!("{}: {}", name, value));
    }
    let signing_string = lines.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Validation(format!("Invalid signature format: {}", e)))?;

    let verifier = VerifyingKey::<Sha256>::new(parse_public_key(public_key_pem)?);
    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature)
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))
}

/// Extract keyId from the Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;
    Ok(parsed.key_id)
}

/// Whether a keyId belongs to `actor_id`.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
    pub created: Option<i64>,
    pub expires: Option<i64>,
}

/// Parse a Signature header value.
///
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="...",created=1,expires=2
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;
    let mut created = None;
    let mut expires = None;

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');

        match key.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect(),
                )
            }
            // base64 may end in '=' padding, which split_once leaves intact
            "signature" => signature = Some(value.to_string()),
            "created" => created = value.parse::<i64>().ok(),
            "expires" => expires = value.parse::<i64>().ok(),
            _ => {}
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        // hs2019 lets the key decide; absent means the same
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["(created)".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
        created,
        expires,
    })
}

/// `SHA-256=<base64(sha256(body))>`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64.encode(hasher.finalize()))
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, AppError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::Validation(format!("Invalid private key: {}", e)))
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, AppError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::Validation(format!("Invalid public key: {}", e)))
}

/// Generate a PEM keypair `(private, public)` for a local actor.
pub fn generate_keypair(bits: usize) -> Result<(String, String), AppError> {
    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits).map_err(|e| AppError::Internal(e.into()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok((private_key_pem, public_key_pem))
}
