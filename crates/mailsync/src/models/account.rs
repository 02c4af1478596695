//! Account model and its OAuth credential

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Seconds before the stated expiry at which a token counts as expired.
pub const EXPIRY_SKEW_SECS: i64 = 300;

/// OAuth credential for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthCredential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Computed on every call, never stored. A credential without an expiry
    /// is treated as valid until the server says otherwise.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + Duration::seconds(EXPIRY_SKEW_SECS),
            None => false,
        }
    }
}

/// A registered Gmail account.
///
/// The engine works on read-only snapshots of this record; refreshed
/// credentials come back as new values rather than mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Database primary key
    pub id: i64,
    pub email: String,
    pub display_name: Option<String>,
    pub credential: OAuthCredential,
}

impl Account {
    pub fn new(id: i64, email: impl Into<String>, credential: OAuthCredential) -> Self {
        Self {
            id,
            email: email.into(),
            display_name: None,
            credential,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        self.credential.is_expired()
    }

    pub fn access_token(&self) -> &str {
        &self.credential.access_token
    }

    /// Copy of this account carrying a different credential.
    pub fn with_credential(&self, credential: OAuthCredential) -> Self {
        Self {
            credential,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_expiry_is_valid() {
        let cred = OAuthCredential::new("tok");
        assert!(!cred.is_expired());
    }

    #[test]
    fn test_expiry_uses_skew() {
        let now = Utc::now();
        let cred = OAuthCredential::new("tok").with_expires_at(now + Duration::seconds(120));
        assert!(cred.is_expired_at(now));

        let cred = OAuthCredential::new("tok").with_expires_at(now + Duration::hours(1));
        assert!(!cred.is_expired_at(now));
    }

    #[test]
    fn test_with_credential_keeps_identity() {
        let account = Account::new(7, "me@example.com", OAuthCredential::new("old"))
            .with_display_name("Me");
        let fresh = account.with_credential(OAuthCredential::new("new"));
        assert_eq!(fresh.id, 7);
        assert_eq!(fresh.display_name.as_deref(), Some("Me"));
        assert_eq!(fresh.access_token(), "new");
        assert_eq!(account.access_token(), "old");
    }
}
