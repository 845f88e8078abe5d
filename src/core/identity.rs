//! Identity tokens used to template recording paths

use serde::Serialize;

use crate::platform;

/// Sanitized `{username}`, `{host}` and `{session}` values
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub username: String,
    pub host: String,
    pub session: String,
}

impl Identity {
    pub fn new(
        username: impl AsRef<str>,
        host: impl AsRef<str>,
        session: impl AsRef<str>,
    ) -> Self {
        let session = sanitize(session.as_ref());
        Self {
            username: sanitize(username.as_ref()),
            host: sanitize(host.as_ref()),
            session: if session == "unknown" {
                "0".to_string()
            } else {
                session
            },
        }
    }

    /// Collect the identity of the current process
    pub fn current() -> Self {
        let username = std::env::var("USERNAME")
            .or_else(|_| std::env::var("USER"))
            .unwrap_or_default();
        let host = sysinfo::System::host_name().unwrap_or_default();
        let session = platform::session_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        Self::new(username, host, session)
    }

    /// Value for a template token name, if it is one we know
    pub fn token(&self, name: &str) -> Option<&str> {
        match name {
            "username" => Some(&self.username),
            "host" => Some(&self.host),
            "session" => Some(&self.session),
            _ => None,
        }
    }
}

/// Replace characters that are illegal in a file name on any supported platform
pub fn sanitize(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    trimmed
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_illegal_characters() {
        assert_eq!(sanitize(r"DOMAIN\alice"), "DOMAIN_alice");
        assert_eq!(sanitize("a/b:c*d?"), "a_b_c_d_");
        assert_eq!(sanitize("tab\there"), "tab_here");
        assert_eq!(sanitize("  "), "unknown");
    }

    #[test]
    fn blank_session_becomes_zero() {
        let id = Identity::new("bob", "box", "");
        assert_eq!(id.session, "0");
        assert_eq!(id.token("username"), Some("bob"));
        assert_eq!(id.token("host"), Some("box"));
        assert_eq!(id.token("bogus"), None);
    }
}
