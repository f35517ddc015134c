use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION};
use std::collections::HashMap;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Credentials holds the static username -> password mapping configured
/// at startup. An empty set means clients connect without authentication
#[derive(Clone, Default)]
pub struct Credentials {
    users: HashMap<String, String>,
}

/// Credentials implementation block
impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// insert adds or replaces a user
    pub fn insert(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.users.insert(username.into(), password.into());
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// verify checks a username/password pair against the configured users
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected == password)
    }

    /// parse_entry splits a `username:password` pair as given on the command line
    pub fn parse_entry(entry: &str) -> Result<(String, String), String> {
        match entry.split_once(':') {
            Some((user, pass)) if !user.is_empty() && !pass.is_empty() => {
                Ok((user.to_string(), pass.to_string()))
            }
            _ => Err(format!("expected USERNAME:PASSWORD, got {entry:?}")),
        }
    }
}

impl<U: Into<String>, P: Into<String>> FromIterator<(U, P)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (U, P)>>(iter: I) -> Self {
        let mut creds = Credentials::new();
        for (user, pass) in iter {
            creds.insert(user, pass);
        }
        creds
    }
}

// Passwords stay out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut users: Vec<_> = self.users.keys().collect();
        users.sort();
        f.debug_struct("Credentials").field("users", &users).finish()
    }
}

/// AuthError is returned by the username/password sub-negotiation
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed authentication request: {0}")]
    Malformed(&'static str),

    #[error("authentication failed for user {username:?}")]
    Rejected { username: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// select_auth_method picks the method for this connection from those the
/// client offered. Without credentials only NO AUTH is acceptable, with
/// credentials only USERNAME/PASSWORD is
pub fn select_auth_method(client_methods: &[u8], credentials: &Credentials) -> AuthMethod {
    let preferred = if credentials.is_empty() {
        AuthMethod::NoAuth
    } else {
        AuthMethod::UserPass
    };

    if client_methods.contains(&(preferred as u8)) {
        preferred
    } else {
        AuthMethod::NoAcceptable
    }
}

/// UserPassRequest is the client's RFC 1929 credentials frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    pub username: String,
    pub password: String,
}

/// parse_userpass parses a complete username/password request
pub fn parse_userpass(bytes: &[u8]) -> Result<UserPassRequest, AuthError> {
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+
    let [version, ulen, rest @ ..] = bytes else {
        return Err(AuthError::Malformed("request shorter than header"));
    };

    if *version != USERPASS_VERSION {
        return Err(AuthError::Malformed("invalid sub-negotiation version"));
    }

    let ulen = *ulen as usize;
    if rest.len() < ulen + 1 {
        return Err(AuthError::Malformed("username truncated"));
    }

    let (username, rest) = rest.split_at(ulen);
    let (plen, password) = (rest[0] as usize, &rest[1..]);
    if password.len() != plen {
        return Err(AuthError::Malformed("password length mismatch"));
    }

    let username = std::str::from_utf8(username).map_err(|_| AuthError::Malformed("username is not UTF-8"))?;
    let password = std::str::from_utf8(password).map_err(|_| AuthError::Malformed("password is not UTF-8"))?;

    Ok(UserPassRequest {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// authenticate_userpass runs the RFC 1929 sub-negotiation and returns the
/// authenticated username. The status reply is always written before returning
/// a Rejected error
pub async fn authenticate_userpass<S>(stream: &mut S, credentials: &Credentials) -> Result<String, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frame = vec![0u8; 2];
    stream.read_exact(&mut frame).await?;

    if frame[0] != USERPASS_VERSION {
        return Err(AuthError::Malformed("invalid sub-negotiation version"));
    }

    // Username, then the password length byte
    let ulen = frame[1] as usize;
    frame.resize(2 + ulen + 1, 0);
    stream.read_exact(&mut frame[2..]).await?;

    let plen = frame[2 + ulen] as usize;
    let start = frame.len();
    frame.resize(start + plen, 0);
    stream.read_exact(&mut frame[start..]).await?;

    let request = parse_userpass(&frame)?;

    let status = if credentials.verify(&request.username, &request.password) {
        AuthStatus::Success
    } else {
        AuthStatus::Failure
    };

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[USERPASS_VERSION, status as u8]).await?;

    match status {
        AuthStatus::Success => Ok(request.username),
        AuthStatus::Failure => Err(AuthError::Rejected {
            username: request.username,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn creds() -> Credentials {
        [("foo", "bar")].into_iter().collect()
    }

    #[test]
    fn no_credentials_selects_no_auth() {
        let empty = Credentials::new();
        assert_eq!(select_auth_method(&[0x00], &empty), AuthMethod::NoAuth);
        assert_eq!(select_auth_method(&[0x02, 0x00], &empty), AuthMethod::NoAuth);
        assert_eq!(select_auth_method(&[0x02], &empty), AuthMethod::NoAcceptable);
        assert_eq!(select_auth_method(&[], &empty), AuthMethod::NoAcceptable);
    }

    #[test]
    fn credentials_require_userpass() {
        assert_eq!(select_auth_method(&[0x00, 0x02], &creds()), AuthMethod::UserPass);
        assert_eq!(select_auth_method(&[0x00], &creds()), AuthMethod::NoAcceptable);
    }

    #[test]
    fn selected_method_was_offered() {
        let offers: &[&[u8]] = &[&[0x00], &[0x01, 0x00], &[0x80, 0x00, 0x02], &[0xFE, 0x00]];
        for offered in offers {
            let method = select_auth_method(offered, &Credentials::new());
            assert!(offered.contains(&(method as u8)));
        }
    }

    #[test]
    fn parse_entry_requires_both_halves() {
        assert_eq!(
            Credentials::parse_entry("foo:b:ar"),
            Ok(("foo".to_string(), "b:ar".to_string()))
        );
        assert!(Credentials::parse_entry("foo").is_err());
        assert!(Credentials::parse_entry(":bar").is_err());
    }

    #[test]
    fn debug_hides_passwords() {
        let printed = format!("{:?}", creds());
        assert!(printed.contains("foo"));
        assert!(!printed.contains("bar"));
    }

    #[test]
    fn userpass_frame_lengths_are_checked() {
        assert_eq!(
            parse_userpass(&[0x01, 3, b'f', b'o', b'o', 3, b'b', b'a', b'r']).unwrap(),
            UserPassRequest {
                username: "foo".into(),
                password: "bar".into()
            }
        );
        assert!(parse_userpass(&[0x01, 3, b'f', b'o', b'o', 4, b'b', b'a', b'r']).is_err());
        assert!(parse_userpass(&[0x05, 3, b'f', b'o', b'o', 3, b'b', b'a', b'r']).is_err());
    }

    #[tokio::test]
    async fn userpass_exchange_success() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x01, 3, b'f', b'o', b'o', 3, b'b', b'a', b'r'])
            .await
            .unwrap();

        let user = authenticate_userpass(&mut server, &creds()).await.unwrap();
        assert_eq!(user, "foo");

        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x00]);
    }

    #[tokio::test]
    async fn userpass_exchange_wrong_password() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x01, 3, b'f', b'o', b'o', 3, b'b', b'a', b'z'])
            .await
            .unwrap();

        let err = authenticate_userpass(&mut server, &creds()).await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { username } if username == "foo"));

        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);
    }
}
