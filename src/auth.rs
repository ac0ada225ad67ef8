use base64::engine::general_purpose;
use base64::Engine;
use hyper::header::HeaderValue;

/// Upstream proxy credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Credentials are only used when a username is present; a missing
    /// password is sent as empty.
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        match username {
            Some(u) if !u.is_empty() => Some(Self::new(u, password.unwrap_or_default())),
            _ => None,
        }
    }

    /// `Basic base64(username:password)`, taken as-is without any escaping
    pub fn basic_value(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!("Basic {}", general_purpose::STANDARD.encode(credentials))
    }

    /// Value for a `Proxy-Authorization` header
    pub fn proxy_authorization(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.basic_value())
            .ok()
            .map(|mut value| {
                value.set_sensitive(true);
                value
            })
    }
}

// Keep passwords out of logs
impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_value_for_known_credentials() {
        let auth = Auth::new("alice".to_string(), "secret1".to_string());
        assert_eq!(auth.basic_value(), "Basic YWxpY2U6c2VjcmV0MQ==");
    }

    #[test]
    fn proxy_authorization_header_is_sensitive() {
        let auth = Auth::new("test".to_string(), "test".to_string());
        let value = auth.proxy_authorization().expect("valid header value");

        assert_eq!(value.to_str().unwrap(), "Basic dGVzdDp0ZXN0");
        assert!(value.is_sensitive());
    }

    #[test]
    fn special_characters_are_not_escaped() {
        let auth = Auth::new("us@r".to_string(), "p:ss/w%rd".to_string());
        let encoded = auth.basic_value();
        let decoded = general_purpose::STANDARD
            .decode(encoded.trim_start_matches("Basic "))
            .unwrap();

        assert_eq!(decoded, b"us@r:p:ss/w%rd");
    }

    #[test]
    fn from_parts_requires_username() {
        assert!(Auth::from_parts(None, Some("secret".to_string())).is_none());
        assert!(Auth::from_parts(Some(String::new()), None).is_none());

        let auth = Auth::from_parts(Some("bob".to_string()), None).unwrap();
        assert_eq!(auth.password, "");
    }

    #[test]
    fn debug_hides_password() {
        let auth = Auth::new("bob".to_string(), "hunter2".to_string());
        let printed = format!("{:?}", auth);
        assert!(printed.contains("bob"));
        assert!(!printed.contains("hunter2"));
    }
}
