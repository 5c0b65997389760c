//! Tamper-evident, time-boxed access grants.
//!
//! A grant signs `path`, `size`, `domain` and `expires` with HMAC-SHA256,
//! each field length-prefixed so no two field tuples share an input. Verification
//! recomputes the signature over the exact strings the client presented, so
//! any change to any field, including re-encoding a number, invalidates it.

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Every verification failure maps to this single error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GrantError {
    #[error("Invalid or expired download link")]
    InvalidOrExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedGrant {
    pub path: String,
    pub size: u64,
    pub domain: String,
    /// Expiry as Unix epoch milliseconds.
    pub expires: i64,
    pub signature: String,
}

impl PresignedGrant {
    pub fn to_query(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("path", &self.path)
            .append_pair("size", &self.size.to_string())
            .append_pair("domain", &self.domain)
            .append_pair("expires", &self.expires.to_string())
            .append_pair("signature", &self.signature)
            .finish()
    }

    /// Full retrieval URL for the grant at `endpoint`.
    pub fn download_url(&self, endpoint: &str) -> String {
        format!("{}?{}", endpoint, self.to_query())
    }
}

/// Grant fields as presented by a client, unparsed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GrantParams {
    pub path: Option<String>,
    pub size: Option<String>,
    pub domain: Option<String>,
    pub expires: Option<String>,
    pub signature: Option<String>,
}

impl From<&PresignedGrant> for GrantParams {
    fn from(grant: &PresignedGrant) -> Self {
        Self {
            path: Some(grant.path.clone()),
            size: Some(grant.size.to_string()),
            domain: Some(grant.domain.clone()),
            expires: Some(grant.expires.to_string()),
            signature: Some(grant.signature.clone()),
        }
    }
}

/// A grant that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedGrant {
    pub path: String,
    pub size: u64,
    pub domain: String,
    pub expires: i64,
}

#[derive(Clone)]
pub struct GrantSigner {
    key: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for GrantSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl GrantSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size")
    }

    /// `<len>:<value>` for each field in order.
    fn canonical(path: &str, size: &str, domain: &str, expires: &str) -> String {
        let mut out = String::with_capacity(path.len() + size.len() + domain.len() + expires.len() + 16);
        for field in [path, size, domain, expires] {
            out.push_str(&field.len().to_string());
            out.push(':');
            out.push_str(field);
        }
        out
    }

    pub fn issue(&self, path: &str, size: u64, domain: &str) -> PresignedGrant {
        self.issue_at(path, size, domain, Utc::now().timestamp_millis())
    }

    pub fn issue_at(&self, path: &str, size: u64, domain: &str, now_ms: i64) -> PresignedGrant {
        let expires = now_ms + self.ttl.as_millis() as i64;
        let mut mac = self.mac();
        mac.update(
            Self::canonical(path, &size.to_string(), domain, &expires.to_string()).as_bytes(),
        );
        PresignedGrant {
            path: path.to_string(),
            size,
            domain: domain.to_string(),
            expires,
            signature: hex::encode(mac.finalize().into_bytes()),
        }
    }

    pub fn verify(&self, params: &GrantParams) -> Result<VerifiedGrant, GrantError> {
        self.verify_at(params, Utc::now().timestamp_millis())
    }

    pub fn verify_at(&self, params: &GrantParams, now_ms: i64) -> Result<VerifiedGrant, GrantError> {
        self.check(params, now_ms).map_err(|reason| {
            debug!(reason, "Grant rejected");
            GrantError::InvalidOrExpired
        })
    }

    fn check(&self, params: &GrantParams, now_ms: i64) -> Result<VerifiedGrant, &'static str> {
        let (Some(path), Some(size), Some(domain), Some(expires), Some(signature)) = (
            params.path.as_deref(),
            params.size.as_deref(),
            params.domain.as_deref(),
            params.expires.as_deref(),
            params.signature.as_deref(),
        ) else {
            return Err("missing field");
        };

        let canonical_sig = signature.len() == 64
            && signature
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !canonical_sig {
            return Err("malformed signature");
        }
        let presented = hex::decode(signature).map_err(|_| "malformed signature")?;

        let mut mac = self.mac();
        mac.update(Self::canonical(path, size, domain, expires).as_bytes());
        mac.verify_slice(&presented).map_err(|_| "signature mismatch")?;

        let expires_ms: i64 = expires.parse().map_err(|_| "malformed expiry")?;
        if now_ms >= expires_ms {
            return Err("expired");
        }
        let size: u64 = size.parse().map_err(|_| "malformed size")?;

        Ok(VerifiedGrant {
            path: path.to_string(),
            size,
            domain: domain.to_string(),
            expires: expires_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn signer() -> GrantSigner {
        GrantSigner::new("test-secret", Duration::from_secs(3600))
    }

    fn issued() -> PresignedGrant {
        signer().issue_at("https://cdn.example/video.mp4", 15_728_640, "cdn.example", NOW)
    }

    #[test]
    fn valid_before_expiry_invalid_after() {
        let grant = issued();
        assert_eq!(grant.expires, NOW + 3_600_000);
        let params = GrantParams::from(&grant);
        let verified = signer().verify_at(&params, grant.expires - 1).unwrap();
        assert_eq!(verified.size, 15_728_640);
        assert_eq!(
            signer().verify_at(&params, grant.expires),
            Err(GrantError::InvalidOrExpired)
        );
    }

    #[test]
    fn mutating_any_field_fails() {
        let grant = issued();
        let base = GrantParams::from(&grant);
        let mutations: Vec<Box<dyn Fn(&mut GrantParams)>> = vec![
            Box::new(|p| p.path = Some("https://cdn.example/other.mp4".into())),
            Box::new(|p| p.size = Some("1".into())),
            Box::new(|p| p.size = Some("015728640".into())),
            Box::new(|p| p.domain = Some("evil.example".into())),
            Box::new(|p| p.expires = Some((NOW + 7_200_000).to_string())),
            Box::new(|p| {
                let mut sig = p.signature.clone().unwrap();
                let flipped = if sig.ends_with('0') { '1' } else { '0' };
                sig.pop();
                sig.push(flipped);
                p.signature = Some(sig);
            }),
            Box::new(|p| p.signature = p.signature.as_ref().map(|s| s.to_uppercase())),
            Box::new(|p| p.signature = None),
        ];
        for (i, mutate) in mutations.iter().enumerate() {
            let mut params = base.clone();
            mutate(&mut params);
            assert_eq!(
                signer().verify_at(&params, NOW + 1),
                Err(GrantError::InvalidOrExpired),
                "mutation {} should fail",
                i
            );
        }
    }

    #[test]
    fn field_boundaries_are_part_of_the_signature() {
        assert_ne!(
            GrantSigner::canonical("https://a.example:8443/v", "1", "a.example", "9"),
            GrantSigner::canonical("https://a.example", "8443/v:1", "a.example", "9"),
        );
        assert_ne!(
            GrantSigner::canonical("p", "1", "a:b", "9"),
            GrantSigner::canonical("p:1", "", "a:b", "9"),
        );

        let grant = signer().issue_at("https://h.example/a:1", 2, "h.example", NOW);
        let shifted = GrantParams {
            path: Some("https://h.example/a".into()),
            size: Some("1:2".into()),
            ..GrantParams::from(&grant)
        };
        assert!(signer().verify_at(&shifted, NOW + 1).is_err());
        assert!(signer().verify_at(&GrantParams::from(&grant), NOW + 1).is_ok());
    }

    #[test]
    fn other_secret_rejects() {
        let grant = issued();
        let other = GrantSigner::new("other-secret", Duration::from_secs(3600));
        assert!(other.verify_at(&GrantParams::from(&grant), NOW + 1).is_err());
    }

    #[test]
    fn query_round_trips_through_url_parsing() {
        let grant = issued();
        let url = url::Url::parse(&grant.download_url("https://svc.example/api/v1/presigned")).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["path"], "https://cdn.example/video.mp4");
        assert_eq!(pairs["signature"], grant.signature);
    }
}
