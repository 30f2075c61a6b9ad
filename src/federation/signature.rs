//! HTTP Signatures and document proofs
//!
//! Signing and verification of federation requests. Transport headers
//! are signed fresh for every delivery attempt; activity documents also
//! carry an embedded proof produced at build time.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Duration, Utc};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};
use std::net::IpAddr;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

/// Extract and validate the remote actor domain from an actor or key ID URL.
///
/// Rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn extract_actor_domain(actor_or_key_id: &str) -> Result<String, AppError> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    Ok(host)
}

/// Headers to add for a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Sign an outgoing HTTP request
///
/// Canonicalizes `(request-target)`, `host`, `date`, and `digest` (when a
/// body is present) and signs the canonical string with RSA-SHA256.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key_pem` - RSA private key in PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    let path = parsed_url.path();
    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let request_target = format!("{} {}", method.to_lowercase(), path_and_query);

    let mut signing_parts = vec![
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");
    let signature_b64 = sign_with_pem(private_key_pem, signing_string.as_bytes())?;

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

/// Verify an inbound HTTP request signature
///
/// Recomputes the canonical string from the *claimed* signed-header list
/// in the presented Signature parameter, recomputes the body digest, and
/// checks the result against the signature. Returns a typed error for any
/// untrusted-input failure; never panics.
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - RSA public key in PEM format
/// * `max_skew` - Accepted clock skew on the Date header
pub fn verify_request(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    max_skew: Duration,
) -> Result<(), AppError> {
    let signature_header = header_str(headers, "signature")?;
    let parsed = parse_signature_header(signature_header)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Validation(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Validation(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Validation(
            "Signed headers must include: digest".to_string(),
        ));
    }

    // Reject stale or future-dated requests to limit replay.
    let date_str = header_str(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::Validation("Invalid Date format".to_string()))?;

    let skew = (Utc::now().timestamp() - date.timestamp()).abs();
    if skew > max_skew.num_seconds() {
        return Err(AppError::Validation(
            "Date header too old or in future".to_string(),
        ));
    }

    // The digest must match the transmitted bytes exactly.
    if let Some(body_data) = body {
        let digest_str = header_str(headers, "digest")?;
        if digest_str != generate_digest(body_data) {
            return Err(AppError::Validation("Digest mismatch".to_string()));
        }
    }

    let mut signing_parts = Vec::new();
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" | "date" | "digest" => header_str(headers, header_name)?.to_string(),
            _ => {
                return Err(AppError::Validation(format!(
                    "Unsupported header in signature: {}",
                    header_name
                )));
            }
        };

        signing_parts.push(format!("{}: {}", header_name, value));
    }

    let signing_string = signing_parts.join("\n");
    verify_with_pem(public_key_pem, signing_string.as_bytes(), &parsed.signature)
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", capitalize(name))))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {} header", capitalize(name))))
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn sign_with_pem(private_key_pem: &str, message: &[u8]) -> Result<String, AppError> {
    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid private key: {}", e)))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, message);

    Ok(BASE64.encode(signature.to_bytes()))
}

fn verify_with_pem(
    public_key_pem: &str,
    message: &[u8],
    signature_b64: &str,
) -> Result<(), AppError> {
    let signature_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid public key: {}", e)))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Validation(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(message, &signature)
        .map_err(|_| AppError::Validation("Signature verification failed".to_string()))
}

/// Embed a detached proof in an activity document
///
/// Signs the digest of the canonical body (without the `signature`
/// member) and attaches creator, timestamp, and signature value. Called
/// once at build time; transport headers are still signed per attempt.
pub fn sign_document(
    document: &mut serde_json::Value,
    private_key_pem: &str,
    key_id: &str,
) -> Result<(), AppError> {
    let object = document
        .as_object_mut()
        .ok_or_else(|| AppError::Validation("Document is not a JSON object".to_string()))?;
    object.remove("signature");

    let canonical = serde_json::to_vec(&*object)
        .map_err(|e| AppError::Validation(format!("Failed to canonicalize document: {}", e)))?;
    let digest = generate_digest(&canonical);
    let signature_value = sign_with_pem(private_key_pem, digest.as_bytes())?;

    object.insert(
        "signature".to_string(),
        serde_json::json!({
            "type": "RsaSignature2017",
            "creator": key_id,
            "created": Utc::now().to_rfc3339(),
            "signatureValue": signature_value,
        }),
    );

    Ok(())
}

/// Verify the embedded proof of an activity document
pub fn verify_document(
    document: &serde_json::Value,
    public_key_pem: &str,
) -> Result<(), AppError> {
    let object = document
        .as_object()
        .ok_or_else(|| AppError::Validation("Document is not a JSON object".to_string()))?;

    let signature_value = object
        .get("signature")
        .and_then(|sig| sig.get("signatureValue"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Validation("Document carries no signature".to_string()))?
        .to_string();

    let mut unsigned = object.clone();
    unsigned.remove("signature");
    let canonical = serde_json::to_vec(&unsigned)
        .map_err(|e| AppError::Validation(format!("Failed to canonicalize document: {}", e)))?;
    let digest = generate_digest(&canonical);

    verify_with_pem(public_key_pem, digest.as_bytes(), &signature_value)
}

/// Extract keyId from the Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let signature_header = header_str(headers, "signature")?;
    let parsed = parse_signature_header(signature_header)?;
    Ok(parsed.key_id)
}

/// Validate that a signature keyId points to the same actor as the
/// activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
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
                "signature" => signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::Validation("Missing algorithm".to_string()))?,
        headers: headers.ok_or_else(|| AppError::Validation("Missing headers".to_string()))?,
        signature: signature
            .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Fetch a remote actor's public key by key ID URL
///
/// Resolves the actor document over HTTP after SSRF checks on the host
/// and its resolved addresses.
///
/// # Returns
/// PEM-encoded public key
pub async fn fetch_public_key(
    key_id: &str,
    http_client: &reqwest::Client,
) -> Result<String, AppError> {
    let actor_domain = extract_actor_domain(key_id)?;
    let actor_url = key_id.split('#').next().unwrap_or(key_id);
    let parsed_actor_url = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;
    let actor_port = parsed_actor_url
        .port_or_known_default()
        .ok_or_else(|| AppError::Validation("Missing port in actor URL".to_string()))?;

    // Resolve DNS before fetching and reject local/private destinations.
    validate_resolved_host_ips(&actor_domain, actor_port).await?;

    let response = http_client
        .get(actor_url)
        .header("Accept", "application/activity+json")
        .send()
        .await
        .map_err(|e| AppError::Federation(format!("Failed to fetch actor: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "Failed to fetch actor: HTTP {}",
            response.status()
        )));
    }

    let actor: serde_json::Value = response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("Failed to parse actor: {}", e)))?;

    let public_key = actor
        .get("publicKey")
        .ok_or_else(|| AppError::Federation("Missing publicKey in actor".to_string()))?;

    // If a key fragment is provided, ensure the actor advertises exactly
    // that key id.
    if key_id.contains('#') {
        let advertised_key_id = public_key
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| AppError::Federation("Missing publicKey.id in actor".to_string()))?;

        if advertised_key_id != key_id {
            return Err(AppError::Validation(
                "Signature keyId does not match actor public key id".to_string(),
            ));
        }
    }

    let public_key_pem = public_key
        .get("publicKeyPem")
        .and_then(|pem| pem.as_str())
        .ok_or_else(|| AppError::Federation("Missing publicKeyPem in actor".to_string()))?;

    Ok(public_key_pem.to_string())
}
