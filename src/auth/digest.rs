//! HTTP Digest authentication (RFC 7616, SHA-256)
//!
//! Credentials live in an htdigest-style file of `user:realm:HA1` lines,
//! where HA1 is the hex SHA-256 of `user:realm:password`.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{AppError, Result};

/// Realm presented to browsers
pub const DEFAULT_REALM: &str = "AAWG WebUI";

const DEFAULT_USER: &str = "admin";
const DEFAULT_PASSWORD: &str = "admin";

/// How long an issued nonce is accepted
const NONCE_LIFETIME: Duration = Duration::from_secs(300);

/// Hex-encoded SHA-256 of `data`
pub fn hash_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// HA1 for a user in a realm
pub fn ha1(user: &str, realm: &str, password: &str) -> String {
    hash_hex(&format!("{}:{}:{}", user, realm, password))
}

/// Credential store and nonce issuer for one realm
pub struct DigestAuth {
    realm: String,
    /// Username to HA1
    users: HashMap<String, String>,
    nonces: Mutex<HashMap<String, Instant>>,
}

impl DigestAuth {
    fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            users: HashMap::new(),
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Load credentials for `realm`, writing the default account if the file is missing
    pub fn load_or_create(path: &Path, realm: &str) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let line = format!(
                "{}:{}:{}\n",
                DEFAULT_USER,
                realm,
                ha1(DEFAULT_USER, realm, DEFAULT_PASSWORD)
            );
            std::fs::write(path, line)?;
            info!("Created web credentials file at {}", path.display());
        }

        let content = std::fs::read_to_string(path)?;
        let mut auth = Self::new(realm);
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.splitn(3, ':').collect();
            match parts.as_slice() {
                [user, line_realm, hash] if *line_realm == realm => {
                    auth.users.insert(user.to_string(), hash.to_ascii_lowercase());
                }
                [_, _, _] => {}
                _ => warn!("Skipping malformed line {} in {}", index + 1, path.display()),
            }
        }

        if auth.users.is_empty() {
            return Err(AppError::Config(format!(
                "No credentials for realm '{}' in {}",
                realm,
                path.display()
            )));
        }
        Ok(auth)
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// `WWW-Authenticate` value carrying a fresh nonce
    pub fn challenge(&self) -> String {
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let mut nonces = self.nonces.lock();
        nonces.retain(|_, issued| issued.elapsed() < NONCE_LIFETIME);
        nonces.insert(nonce.clone(), Instant::now());

        format!(
            "Digest realm=\"{}\", qop=\"auth\", algorithm=SHA-256, nonce=\"{}\"",
            self.realm, nonce
        )
    }

    /// Check an `Authorization` header against a request
    pub fn verify(&self, method: &str, request_uri: &str, header: &str) -> bool {
        let Some(params) = parse_digest(header) else {
            return false;
        };
        let field = |name: &str| params.get(name).map(String::as_str);

        let (Some(user), Some(realm), Some(nonce), Some(uri), Some(response)) = (
            field("username"),
            field("realm"),
            field("nonce"),
            field("uri"),
            field("response"),
        ) else {
            return false;
        };

        if realm != self.realm || uri != request_uri {
            return false;
        }
        if field("algorithm").is_some_and(|alg| !alg.eq_ignore_ascii_case("SHA-256")) {
            return false;
        }
        let fresh = self
            .nonces
            .lock()
            .get(nonce)
            .is_some_and(|issued| issued.elapsed() < NONCE_LIFETIME);
        if !fresh {
            return false;
        }
        let Some(ha1) = self.users.get(user) else {
            return false;
        };

        let ha2 = hash_hex(&format!("{}:{}", method, uri));
        let expected = match field("qop") {
            None => hash_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
            Some("auth") => {
                let (Some(nc), Some(cnonce)) = (field("nc"), field("cnonce")) else {
                    return false;
                };
                hash_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2))
            }
            Some(_) => return false,
        };
        expected.eq_ignore_ascii_case(response)
    }
}

/// Split `Digest k="v", k=v` into lowercase keys and unquoted values
fn parse_digest(header: &str) -> Option<HashMap<String, String>> {
    let (scheme, mut rest) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Digest") {
        return None;
    }

    let mut params = HashMap::new();
    rest = rest.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let after = after.trim_start();
        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => match after.find(',') {
                Some(end) => (after[..end].trim(), &after[end..]),
                None => (after.trim(), ""),
            },
        };
        params.insert(key.trim().to_ascii_lowercase(), value.to_string());
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    Some(params)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build the header a browser would send for `challenge`
    pub(crate) fn authorization(
        challenge: &str,
        user: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> String {
        let params = parse_digest(challenge).unwrap();
        let realm = &params["realm"];
        let nonce = &params["nonce"];
        let ha1 = ha1(user, realm, password);
        let ha2 = hash_hex(&format!("{}:{}", method, uri));
        let response = hash_hex(&format!("{}:{}:00000001:0a4f113b:auth:{}", ha1, nonce, ha2));
        format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
             algorithm=SHA-256, qop=auth, nc=00000001, cnonce=\"0a4f113b\", response=\"{}\"",
            user, realm, nonce, uri, response
        )
    }

    fn admin_auth() -> DigestAuth {
        let mut auth = DigestAuth::new(DEFAULT_REALM);
        auth.users
            .insert("admin".to_string(), ha1("admin", DEFAULT_REALM, "admin"));
        auth
    }

    #[test]
    fn test_parse_digest_header() {
        let params = parse_digest(
            r#"Digest username="admin", realm="AAWG WebUI", nc=00000001, uri="/api/config?a=1,b=2""#,
        )
        .unwrap();
        assert_eq!(params["username"], "admin");
        assert_eq!(params["realm"], "AAWG WebUI");
        assert_eq!(params["nc"], "00000001");
        assert_eq!(params["uri"], "/api/config?a=1,b=2");

        assert!(parse_digest("Basic YWRtaW46YWRtaW4=").is_none());
    }

    #[test]
    fn test_verify_with_qop() {
        let auth = admin_auth();
        let challenge = auth.challenge();
        assert!(challenge.contains("realm=\"AAWG WebUI\""));

        let header = authorization(&challenge, "admin", "admin", "POST", "/api/config");
        assert!(auth.verify("POST", "/api/config", &header));
        // Bound to method and target
        assert!(!auth.verify("GET", "/api/config", &header));
        assert!(!auth.verify("POST", "/api/status", &header));
    }

    #[test]
    fn test_verify_rejects_wrong_password_and_unknown_nonce() {
        let auth = admin_auth();
        let challenge = auth.challenge();
        let header = authorization(&challenge, "admin", "wrong", "GET", "/");
        assert!(!auth.verify("GET", "/", &header));

        let other = admin_auth();
        let header = authorization(&other.challenge(), "admin", "admin", "GET", "/");
        assert!(!auth.verify("GET", "/", &header));
    }

    #[test]
    fn test_load_creates_default_account() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web").join("aawg.htdigest");

        let auth = DigestAuth::load_or_create(&path, DEFAULT_REALM).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content.trim(),
            format!("admin:AAWG WebUI:{}", ha1("admin", "AAWG WebUI", "admin"))
        );

        let header = authorization(&auth.challenge(), "admin", "admin", "GET", "/");
        assert!(auth.verify("GET", "/", &header));
    }

    #[test]
    fn test_load_keeps_only_matching_realm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        std::fs::write(
            &path,
            format!(
                "# accounts\nother:Elsewhere:{}\ndriver:AAWG WebUI:{}\nbroken\n",
                ha1("other", "Elsewhere", "x"),
                ha1("driver", "AAWG WebUI", "road")
            ),
        )
        .unwrap();

        let auth = DigestAuth::load_or_create(&path, DEFAULT_REALM).unwrap();
        let challenge = auth.challenge();
        let header = authorization(&challenge, "driver", "road", "GET", "/");
        assert!(auth.verify("GET", "/", &header));
        let header = authorization(&challenge, "other", "x", "GET", "/");
        assert!(!auth.verify("GET", "/", &header));

        std::fs::write(&path, "other:Elsewhere:abc\n").unwrap();
        assert!(matches!(
            DigestAuth::load_or_create(&path, DEFAULT_REALM),
            Err(AppError::Config(_))
        ));
    }
}
