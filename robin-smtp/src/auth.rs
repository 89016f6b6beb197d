//! SMTP AUTH credential handling and the Dovecot SASL backend.
//!
//! The session decodes PLAIN/LOGIN exchanges into a username/password pair
//! and hands them to an [`Authenticator`]. The production implementation
//! speaks the Dovecot authentication protocol over its UNIX socket; tests
//! install a static map instead.

use std::{fmt::Debug, path::PathBuf, sync::atomic::{AtomicU32, Ordering}};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

use crate::error::AuthError;

/// Decoded credentials from an AUTH exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Decodes the base64 `authzid\0authcid\0password` form of AUTH PLAIN.
pub fn decode_plain(initial: &str) -> Result<Credentials, AuthError> {
    let decoded = BASE64
        .decode(initial.trim())
        .map_err(|e| AuthError::Malformed(e.to_string()))?;

    let mut parts = decoded.split(|byte| *byte == 0);
    let _authzid = parts.next();
    let authcid = parts.next().ok_or_else(|| {
        AuthError::Malformed("PLAIN response is missing the authcid".to_string())
    })?;
    let password = parts.next().ok_or_else(|| {
        AuthError::Malformed("PLAIN response is missing the password".to_string())
    })?;

    Ok(Credentials {
        username: String::from_utf8_lossy(authcid).into_owned(),
        password: String::from_utf8_lossy(password).into_owned(),
    })
}

/// Decodes one base64 line of an AUTH LOGIN exchange.
pub fn decode_login_field(line: &str) -> Result<String, AuthError> {
    BASE64
        .decode(line.trim())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| AuthError::Malformed(e.to_string()))
}

#[async_trait]
pub trait Authenticator: Send + Sync + Debug {
    /// Returns `Ok(true)` when the credentials are valid.
    async fn authenticate(&self, credentials: &Credentials) -> Result<bool, AuthError>;
}

/// Dovecot SASL client over the authentication UNIX socket.
///
/// Handshake: both sides announce `VERSION`, the server ends its greeting
/// with `DONE`; each request is `AUTH <id> PLAIN service=smtp resp=<base64>`
/// answered by `OK <id>` or `FAIL <id>` (tab-separated on the wire).
#[derive(Debug)]
pub struct DovecotSasl {
    socket: PathBuf,
    next_request: AtomicU32,
}

impl DovecotSasl {
    #[must_use]
    pub fn new(socket: PathBuf) -> Self {
        Self {
            socket,
            next_request: AtomicU32::new(1),
        }
    }

    async fn read_until(
        stream: &mut UnixStream,
        buffer: &mut Vec<u8>,
        stop: impl Fn(&str) -> bool,
    ) -> Result<String, AuthError> {
        let mut chunk = [0u8; 1024];

        loop {
            for line in String::from_utf8_lossy(buffer).lines() {
                if stop(line) {
                    return Ok(line.to_string());
                }
            }

            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(AuthError::Protocol(
                    "authenticator closed the connection".to_string(),
                ));
            }
            buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

#[async_trait]
impl Authenticator for DovecotSasl {
    async fn authenticate(&self, credentials: &Credentials) -> Result<bool, AuthError> {
        let mut stream = UnixStream::connect(&self.socket).await?;
        let mut buffer = Vec::new();

        stream
            .write_all(format!("VERSION\t1\t1\nCPID\t{}\n", std::process::id()).as_bytes())
            .await?;

        // The greeting ends with DONE once the mechanism list is complete.
        Self::read_until(&mut stream, &mut buffer, |line| line == "DONE").await?;
        buffer.clear();

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let response = BASE64.encode(format!(
            "\0{}\0{}",
            credentials.username, credentials.password
        ));

        stream
            .write_all(
                format!("AUTH\t{request_id}\tPLAIN\tservice=smtp\tresp={response}\n").as_bytes(),
            )
            .await?;

        let ok_prefix = format!("OK\t{request_id}");
        let fail_prefix = format!("FAIL\t{request_id}");
        let reply = Self::read_until(&mut stream, &mut buffer, |line| {
            line.starts_with(&ok_prefix) || line.starts_with(&fail_prefix)
        })
        .await?;

        Ok(reply.starts_with(&ok_prefix))
    }
}

/// Fixed user database for tests and development setups.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    users: ahash::AHashMap<String, String>,
}

impl StaticAuthenticator {
    #[must_use]
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<bool, AuthError> {
        Ok(self
            .users
            .get(&credentials.username)
            .is_some_and(|password| *password == credentials.password))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::{decode_login_field, decode_plain, Authenticator, StaticAuthenticator};

    #[test]
    fn plain_with_and_without_authzid() {
        // \0user\0secret
        let creds = decode_plain("AHVzZXIAc2VjcmV0").unwrap();
        assert_eq!(creds.username, "user");
        assert_eq!(creds.password, "secret");

        // admin\0user\0secret
        let creds = decode_plain("YWRtaW4AdXNlcgBzZWNyZXQ=").unwrap();
        assert_eq!(creds.username, "user");
        assert_eq!(creds.password, "secret");

        assert!(decode_plain("not base64 !!").is_err());
        assert!(decode_plain("dXNlcg==").is_err());
    }

    #[test]
    fn login_fields_decode() {
        assert_eq!(decode_login_field("dXNlcg==").unwrap(), "user");
        assert!(decode_login_field("@@@").is_err());
    }

    #[tokio::test]
    async fn static_authenticator_matches_exactly() {
        let auth = StaticAuthenticator::default().with_user("user", "secret");

        let ok = super::Credentials {
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        let bad = super::Credentials {
            username: "user".to_string(),
            password: "wrong".to_string(),
        };

        assert!(auth.authenticate(&ok).await.unwrap());
        assert!(!auth.authenticate(&bad).await.unwrap());
    }
}
