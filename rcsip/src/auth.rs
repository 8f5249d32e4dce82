//! Digest authentication for in-dialog requests.
//!
//! One [`AuthenticationAgent`] is scoped to one session: nonce and cnonce
//! state belong to a single challenge and must never be shared across
//! dialogs.

use std::fmt::Write;

use md5::Digest;

use crate::message::{Request, Response};

/// Parameters of a 401/407 digest challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub algorithm: String,
}

/// Account credentials supplied by the provisioning layer.
#[derive(Debug, Clone, Default)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

/// Parses a `Proxy-Authenticate`/`WWW-Authenticate` header value.
pub fn parse_challenge(value: &str) -> Option<DigestChallenge> {
    let mut parts = value.trim().splitn(2, ' ');
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("digest") {
        return None;
    }
    let params = parts.next()?;

    let mut realm = None;
    let mut nonce = None;
    let mut qop = None;
    let mut algorithm = String::from("MD5");

    for param in params.split(',') {
        let mut kv = param.trim().splitn(2, '=');
        let key = kv.next()?.trim();
        let raw_val = kv.next()?.trim().trim_matches('"');
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(raw_val.to_string()),
            "nonce" => nonce = Some(raw_val.to_string()),
            "qop" => qop = Some(raw_val.split(',').next().unwrap_or(raw_val).to_string()),
            "algorithm" => {
                algorithm.clear();
                algorithm.push_str(raw_val);
            }
            _ => {}
        }
    }

    Some(DigestChallenge {
        realm: realm?,
        nonce: nonce?,
        qop,
        algorithm,
    })
}

/// Holds the challenge learned from a 401/407 and stamps later requests
/// within the same dialog.
pub struct AuthenticationAgent {
    credentials: UserCredentials,
    challenge: Option<DigestChallenge>,
    cnonce: String,
    nc: u32,
}

impl AuthenticationAgent {
    pub fn new(credentials: UserCredentials) -> Self {
        AuthenticationAgent {
            credentials,
            challenge: None,
            cnonce: format!("{:08x}", rand::random::<u32>()),
            nc: 0,
        }
    }

    /// Stores the challenge carried by a 401/407 response, if any.
    pub fn read_proxy_authenticate(&mut self, response: &Response) {
        let header = response
            .headers
            .get("Proxy-Authenticate")
            .or_else(|| response.headers.get("WWW-Authenticate"));

        if let Some(value) = header {
            match parse_challenge(value) {
                Some(challenge) => {
                    log::debug!("learned digest challenge for realm {}", challenge.realm);
                    self.challenge = Some(challenge);
                }
                None => log::warn!("unparseable digest challenge: {}", value),
            }
        }
    }

    pub fn has_challenge(&self) -> bool {
        self.challenge.is_some()
    }

    /// Stamps `Proxy-Authorization` on the request.
    ///
    /// Without a stored challenge this is a no-op, not an error.
    pub fn set_proxy_authorization_header(&mut self, request: &mut Request) {
        let Some(challenge) = self.challenge.clone() else {
            return;
        };

        self.nc += 1;
        let value = self.authorization_value(&challenge, request.method.as_str(), &request.uri);
        request.headers.set("Proxy-Authorization", value);
    }

    fn authorization_value(&self, challenge: &DigestChallenge, method: &str, uri: &str) -> String {
        let ha1 = md5_hex(
            format!(
                "{}:{}:{}",
                self.credentials.username, challenge.realm, self.credentials.password
            )
            .as_bytes(),
        );
        let ha2 = md5_hex(format!("{}:{}", method, uri).as_bytes());

        let response = match &challenge.qop {
            Some(qop) => md5_hex(
                format!(
                    "{}:{}:{:08x}:{}:{}:{}",
                    ha1, challenge.nonce, self.nc, self.cnonce, qop, ha2
                )
                .as_bytes(),
            ),
            None => md5_hex(format!("{}:{}:{}", ha1, challenge.nonce, ha2).as_bytes()),
        };

        let mut value = String::new();
        let _ = write!(
            value,
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
            self.credentials.username, challenge.realm, challenge.nonce, uri, response, challenge.algorithm
        );
        if let Some(qop) = &challenge.qop {
            let _ = write!(value, ", qop={}, cnonce=\"{}\", nc={:08x}", qop, self.cnonce, self.nc);
        }
        value
    }
}

fn md5_hex(data: &[u8]) -> String {
    let digest = md5::Md5::digest(data);
    let mut out = String::with_capacity(32);
    for b in &digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;

    fn challenged_response() -> Response {
        let mut response = Response::new(407, "Proxy Authentication Required");
        response.headers.push(
            "Proxy-Authenticate",
            r#"Digest realm="testrealm@host.com", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", algorithm=MD5"#,
        );
        response
    }

    #[test]
    fn digest_response_matches_rfc_reference() {
        let challenge = parse_challenge(
            r#"Digest realm="testrealm@host.com", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", algorithm=MD5"#,
        )
        .unwrap();
        let agent = AuthenticationAgent::new(UserCredentials {
            username: "Mufasa".into(),
            password: "Circle Of Life".into(),
        });
        let value = agent.authorization_value(&challenge, "GET", "/dir/index.html");
        assert!(
            value.contains("response=\"670fd8c2df070c60b045671b8b24ff02\""),
            "unexpected header: {}",
            value
        );
    }

    #[test]
    fn stamping_without_challenge_is_a_noop() {
        let mut agent = AuthenticationAgent::new(UserCredentials::default());
        let mut request = Request::new(Method::Bye, "sip:bob@example.com");
        agent.set_proxy_authorization_header(&mut request);
        assert_eq!(request.headers.get("Proxy-Authorization"), None);
    }

    #[test]
    fn stamps_after_reading_challenge() {
        let mut agent = AuthenticationAgent::new(UserCredentials {
            username: "alice".into(),
            password: "secret".into(),
        });
        agent.read_proxy_authenticate(&challenged_response());
        assert!(agent.has_challenge());

        let mut request = Request::new(Method::Bye, "sip:bob@example.com");
        agent.set_proxy_authorization_header(&mut request);
        let header = request.headers.get("Proxy-Authorization").unwrap();
        assert!(header.starts_with("Digest username=\"alice\""));
        assert!(header.contains("uri=\"sip:bob@example.com\""));
    }

    #[test]
    fn ignores_non_digest_schemes() {
        assert_eq!(parse_challenge("Basic realm=\"x\""), None);
    }
}
