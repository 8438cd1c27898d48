//! Connect endpoint wire format.
//!
//! The client sends one JSON [`ConnectRequest`] on `/connect` and gets back one
//! JSON [`ConnectResponse`]: `{"id": <token>, "status": null}` on success, or
//! `{"id": null, "status": <message>}` when the request was invalid or the
//! backend connection failed.

use serde::Deserialize;
use termgate_core::{Credentials, Target};

/// Port as sent by the client; HTML forms submit it as a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(i64),
    Text(String),
}

/// A request to open a backend session.
#[derive(Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    port: Option<PortField>,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    privatekey: Option<String>,
}

impl ConnectRequest {
    /// Parse a request from a raw message payload.
    pub fn parse(payload: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(payload).map_err(|e| format!("Invalid request: {e}"))
    }

    /// Validate the fields and turn them into a connect target.
    ///
    /// The error string is shown to the user as the status message.
    pub fn into_target(self) -> Result<Target, String> {
        let hostname = self.hostname.trim().to_string();
        if hostname.is_empty() {
            return Err("Empty hostname".into());
        }

        let port = match &self.port {
            Some(PortField::Number(n)) => Some((*n, n.to_string())),
            Some(PortField::Text(s)) => Some((s.trim().parse::<i64>().unwrap_or(0), s.clone())),
            None => None,
        };
        let port = match port {
            Some((n, _)) if n > 0 && n < 65536 => n as u16,
            Some((_, shown)) => return Err(format!("Invalid port {shown}")),
            None => return Err("Invalid port ".into()),
        };

        if self.username.is_empty() {
            return Err("Empty username".into());
        }

        Ok(Target {
            host: hostname,
            port,
            credentials: Credentials {
                username: self.username,
                password: self.password.filter(|p| !p.is_empty()),
                private_key: self.privatekey.filter(|k| !k.trim().is_empty()),
            },
        })
    }
}

/// Answer to a [`ConnectRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub id: Option<String>,
    pub status: Option<String>,
}

impl ConnectResponse {
    pub fn ok(token: String) -> Self {
        Self {
            id: Some(token),
            status: None,
        }
    }

    pub fn failed(status: impl Into<String>) -> Self {
        Self {
            id: None,
            status: Some(status.into()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({ "id": self.id, "status": self.status }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(json: &str) -> Result<Target, String> {
        ConnectRequest::parse(json.as_bytes())?.into_target()
    }

    #[test]
    fn accepts_numeric_and_string_ports() {
        let t = target(r#"{"hostname":"10.0.0.1","port":22,"username":"root"}"#).unwrap();
        assert_eq!((t.host.as_str(), t.port), ("10.0.0.1", 22));

        let t = target(r#"{"hostname":"example.com","port":"2222","username":"bob","password":"pw"}"#)
            .unwrap();
        assert_eq!(t.port, 2222);
        assert_eq!(t.credentials.username, "bob");
        assert_eq!(t.credentials.password.as_deref(), Some("pw"));
    }

    #[test]
    fn validation_messages() {
        assert_eq!(
            target(r#"{"hostname":"","port":22,"username":"root"}"#).err(),
            Some("Empty hostname".to_string())
        );
        assert_eq!(
            target(r#"{"hostname":"h","port":0,"username":"root"}"#).err(),
            Some("Invalid port 0".to_string())
        );
        assert_eq!(
            target(r#"{"hostname":"h","port":"65536","username":"root"}"#).err(),
            Some("Invalid port 65536".to_string())
        );
        assert_eq!(
            target(r#"{"hostname":"h","port":"ssh","username":"root"}"#).err(),
            Some("Invalid port ssh".to_string())
        );
        assert_eq!(
            target(r#"{"hostname":"h","username":"root"}"#).err(),
            Some("Invalid port ".to_string())
        );
        assert_eq!(
            target(r#"{"hostname":"h","port":22,"username":""}"#).err(),
            Some("Empty username".to_string())
        );
    }

    #[test]
    fn empty_secrets_become_none() {
        let t = target(r#"{"hostname":"h","port":22,"username":"u","password":"","privatekey":"  "}"#)
            .unwrap();
        assert!(t.credentials.password.is_none());
        assert!(t.credentials.private_key.is_none());
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(ConnectRequest::parse(b"not json")
            .err()
            .unwrap()
            .starts_with("Invalid request"));
    }

    #[test]
    fn response_shape() {
        assert_eq!(
            ConnectResponse::ok("abc".into()).to_json(),
            r#"{"id":"abc","status":null}"#
        );
        assert_eq!(
            ConnectResponse::failed("Authentication failed.").to_json(),
            r#"{"id":null,"status":"Authentication failed."}"#
        );
    }
}
