//! Authentication types

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// User metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    /// Timestamp when the account was created (Unix timestamp in milliseconds)
    pub creation_timestamp: i64,

    /// Timestamp of the last sign-in (Unix timestamp in milliseconds)
    pub last_sign_in_timestamp: i64,
}

/// User information attributed to one identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// User ID from the provider
    pub uid: String,

    /// Display name
    pub display_name: Option<String>,

    /// Email address
    pub email: Option<String>,

    /// Photo URL
    pub photo_url: Option<String>,

    /// Provider ID (e.g. "password", "google.com")
    pub provider_id: String,
}

/// Authentication credential
///
/// Built client-side and exchanged for a signed-in user via
/// [`Auth::sign_in_with_credential`](crate::auth::Auth::sign_in_with_credential).
#[derive(Debug, Clone)]
pub enum Credential {
    /// Email and password credential
    EmailPassword {
        /// Email address
        email: String,
        /// Password
        password: String,
    },

    /// Google OAuth credential
    Google {
        /// Google Sign-In ID token
        id_token: Option<String>,
        /// Google Sign-In access token
        access_token: Option<String>,
    },

    /// Facebook OAuth credential
    Facebook {
        /// Facebook access token
        access_token: String,
    },

    /// GitHub OAuth credential
    GitHub {
        /// GitHub OAuth access token
        token: String,
    },

    /// Generic OAuth2 credential
    OAuth {
        /// Provider ID (e.g. "apple.com", "microsoft.com")
        provider_id: String,
        /// ID token (OIDC)
        id_token: Option<String>,
        /// Access token
        access_token: Option<String>,
        /// Raw nonce
        raw_nonce: Option<String>,
    },

    /// Anonymous credential
    Anonymous,

    /// Custom token credential
    CustomToken {
        /// Custom JWT token
        token: String,
    },
}

impl Credential {
    /// Get the provider ID for this credential
    pub fn provider_id(&self) -> &str {
        match self {
            Credential::EmailPassword { .. } => "password",
            Credential::Google { .. } => "google.com",
            Credential::Facebook { .. } => "facebook.com",
            Credential::GitHub { .. } => "github.com",
            Credential::OAuth { provider_id, .. } => provider_id,
            Credential::Anonymous => "anonymous",
            Credential::CustomToken { .. } => "custom",
        }
    }
}

/// A user account
///
/// A plain snapshot of account state; mutating operations live on
/// [`Auth`](crate::auth::Auth) and update the account the value was read
/// from, not the value itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID
    pub uid: String,

    /// Email address (if available)
    pub email: Option<String>,

    /// Display name (if available)
    pub display_name: Option<String>,

    /// Photo URL (if available)
    pub photo_url: Option<String>,

    /// Whether the email address has been verified
    pub email_verified: bool,

    /// Whether the account was created by an anonymous sign-in
    pub is_anonymous: bool,

    /// User metadata
    pub metadata: UserMetadata,

    /// Provider data for this user
    pub provider_data: Vec<UserInfo>,
}

/// User profile update request
///
/// Fields left as `None` keep their current value.
#[derive(Debug, Default, Clone)]
pub struct UserProfile {
    /// Display name to update (None = no change)
    pub display_name: Option<String>,

    /// Photo URL to update (None = no change)
    pub photo_url: Option<String>,
}

impl UserProfile {
    /// Create a new profile update with display name
    pub fn with_display_name(display_name: impl Into<String>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            photo_url: None,
        }
    }

    /// Create a new profile update with photo URL
    pub fn with_photo_url(photo_url: impl Into<String>) -> Self {
        Self {
            display_name: None,
            photo_url: Some(photo_url.into()),
        }
    }

    /// Set display name
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set photo URL
    pub fn photo_url(mut self, url: impl Into<String>) -> Self {
        self.photo_url = Some(url.into());
        self
    }
}

/// Authentication result
///
/// Returned from credential sign-in operations.
#[derive(Debug, Clone)]
pub struct AuthResult {
    /// The signed-in user
    pub user: Arc<User>,

    /// Additional user info (if available)
    pub additional_user_info: Option<AdditionalUserInfo>,
}

/// Additional user information from sign-in
#[derive(Debug, Clone)]
pub struct AdditionalUserInfo {
    /// Provider ID
    pub provider_id: String,

    /// Whether this sign-in created the account
    pub is_new_user: bool,

    /// Profile data from the provider
    pub profile: Option<serde_json::Value>,
}
