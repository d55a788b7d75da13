//! Nimbus Authentication
//!
//! Account management and sign-in for one app. Every asynchronous operation
//! returns a [`Future`] immediately and resolves on a background task; the
//! most recent future of each operation kind stays reachable through the
//! matching `*_last_result()` accessor.

use async_stream::stream;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use futures::Stream;
use once_cell::sync::Lazy;
use serde_json::json;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock, Weak};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::app::App;
use crate::auth::types::{
    AdditionalUserInfo, AuthResult, Credential, User, UserInfo, UserMetadata, UserProfile,
};
use crate::error::AuthError;
use crate::future::{Future, FutureRegistry, LastResult};

/// Global map of app names to Auth instances
static AUTH_INSTANCES: Lazy<RwLock<HashMap<String, Auth>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Tokens are reissued once they expire within this window, matching the
/// refresh behavior of the platform's other clients.
const TOKEN_REFRESH_WINDOW_SECS: i64 = 300;
const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Observer of sign-in state
///
/// Registered listeners are called with the current state immediately and
/// again after every sign-in and sign-out.
pub trait AuthStateListener: Send + Sync {
    /// Called with the signed-in user, or `None` after a sign-out
    fn on_auth_state_changed(&self, user: Option<&User>);
}

/// Handle for removing an [`AuthStateListener`]
///
/// Holds no strong reference to the auth instance; a registration outliving
/// its instance removes nothing.
pub struct AuthStateListenerRegistration {
    auth: Weak<AuthInner>,
    id: u64,
}

impl AuthStateListenerRegistration {
    /// Removes the listener; it will not be called again
    ///
    /// Dropping the registration without calling this has the same effect.
    pub fn remove(self) {}
}

impl Drop for AuthStateListenerRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.auth.upgrade() {
            inner
                .listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for AuthStateListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStateListenerRegistration")
            .field("id", &self.id)
            .finish()
    }
}

/// Nimbus Authentication instance
///
/// Each app has at most one Auth instance (singleton pattern). Use
/// [`Auth::get_instance`] to obtain or create it.
#[derive(Clone)]
pub struct Auth {
    inner: Arc<AuthInner>,
}

struct AuthInner {
    app_name: String,
    api_key: String,
    users: StdRwLock<HashMap<String, AccountRecord>>,
    current_user: StdRwLock<Option<Arc<User>>>,
    issued_token: StdRwLock<Option<IssuedToken>>,
    state_tx: broadcast::Sender<Option<Arc<User>>>,
    listeners: StdRwLock<Vec<(u64, Arc<dyn AuthStateListener>)>>,
    next_listener_id: AtomicU64,
    deleted: AtomicBool,
    futures: Arc<FutureRegistry>,
    last: AuthLastResults,
}

/// Stored account state, the in-process stand-in for the account service
struct AccountRecord {
    uid: String,
    email: Option<String>,
    password: Option<String>,
    display_name: Option<String>,
    photo_url: Option<String>,
    email_verified: bool,
    disabled: bool,
    provider_id: String,
    creation_timestamp: i64,
    last_sign_in_timestamp: i64,
}

struct IssuedToken {
    value: String,
    expires_at: i64,
}

#[derive(Default)]
struct AuthLastResults {
    sign_in_anonymously: LastResult<User>,
    sign_in_with_email: LastResult<User>,
    create_user: LastResult<User>,
    sign_in_with_credential: LastResult<AuthResult>,
    sign_in_with_custom_token: LastResult<User>,
    fetch_providers: LastResult<Vec<String>>,
    send_password_reset: LastResult<()>,
    token: LastResult<String>,
    update_user: LastResult<()>,
    delete_user: LastResult<()>,
}

impl Auth {
    /// Get or create the Auth instance for `app`
    ///
    /// # Example
    /// ```no_run
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// use nimbus_sdk::{App, AppOptions, Auth};
    ///
    /// let app = App::create(AppOptions {
    ///     api_key: "YOUR_API_KEY".to_string(),
    ///     project_id: "your-project-id".to_string(),
    ///     ..Default::default()
    /// })
    /// .await?;
    /// let auth = Auth::get_instance(&app).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_instance(app: &App) -> Result<Self, AuthError> {
        // Validate API key (error case first)
        if app.options().api_key.is_empty() {
            return Err(AuthError::InvalidApiKey);
        }

        let mut instances = AUTH_INSTANCES.write().await;

        // Check if instance already exists
        if let Some(auth) = instances.get(app.name()) {
            return Ok(auth.clone());
        }

        // Create broadcast channel for auth state changes (capacity: 16)
        let (state_tx, _) = broadcast::channel(16);

        let auth = Auth {
            inner: Arc::new(AuthInner {
                app_name: app.name().to_string(),
                api_key: app.options().api_key.clone(),
                users: StdRwLock::new(HashMap::new()),
                current_user: StdRwLock::new(None),
                issued_token: StdRwLock::new(None),
                state_tx,
                listeners: StdRwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                deleted: AtomicBool::new(false),
                futures: Arc::new(FutureRegistry::new()),
                last: AuthLastResults::default(),
            }),
        };

        debug!(app = %app.name(), "created auth instance");
        instances.insert(app.name().to_string(), auth.clone());

        Ok(auth)
    }

    /// Name of the app this instance belongs to
    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    /// API key this instance signs in with
    pub fn api_key(&self) -> &str {
        &self.inner.api_key
    }

    /// The signed-in user, or `None`
    pub fn current_user(&self) -> Option<Arc<User>> {
        self.inner
            .current_user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sign out the current user
    ///
    /// Always succeeds; listeners and streams observe `None`.
    pub fn sign_out(&self) {
        self.inner.set_current_user(None);
    }

    /// Sign in without an account
    pub fn sign_in_anonymously(&self) -> Future<User> {
        let future = self.inner.futures.alloc::<User>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.anonymous_sign_in() {
                Ok(user) => inner.futures.complete(handle, user),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.sign_in_anonymously.set(&future);
        future
    }

    /// Sign in with an email address and password
    ///
    /// # Example
    /// ```no_run
    /// # async fn example(auth: nimbus_sdk::Auth) {
    /// let user = auth
    ///     .sign_in_with_email_and_password("user@example.com", "password")
    ///     .await
    ///     .unwrap();
    /// println!("Signed in: {}", user.uid);
    /// # }
    /// ```
    pub fn sign_in_with_email_and_password(
        &self,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Future<User> {
        let future = self.inner.futures.alloc::<User>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let email = email.into();
        let password = password.into();
        tokio::spawn(async move {
            match inner.password_sign_in(&email, &password) {
                Ok(user) => inner.futures.complete(handle, user),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.sign_in_with_email.set(&future);
        future
    }

    /// Create an email/password account and sign in as it
    pub fn create_user_with_email_and_password(
        &self,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Future<User> {
        let future = self.inner.futures.alloc::<User>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let email = email.into();
        let password = password.into();
        tokio::spawn(async move {
            match inner.create_user(&email, &password) {
                Ok(user) => inner.futures.complete(handle, user),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.create_user.set(&future);
        future
    }

    /// Sign in with a provider credential
    pub fn sign_in_with_credential(&self, credential: Credential) -> Future<AuthResult> {
        let future = self.inner.futures.alloc::<AuthResult>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.credential_sign_in(credential) {
                Ok(result) => inner.futures.complete(handle, result),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.sign_in_with_credential.set(&future);
        future
    }

    /// Sign in with a custom token minted by the application backend
    ///
    /// The same token always signs in the same account.
    pub fn sign_in_with_custom_token(&self, token: impl Into<String>) -> Future<User> {
        let future = self.inner.futures.alloc::<User>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let token = token.into();
        tokio::spawn(async move {
            match inner.custom_token_sign_in(&token) {
                Ok(user) => inner.futures.complete(handle, user),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.sign_in_with_custom_token.set(&future);
        future
    }

    /// List the provider IDs usable to sign in as `email`
    pub fn fetch_providers_for_email(&self, email: impl Into<String>) -> Future<Vec<String>> {
        let future = self.inner.futures.alloc::<Vec<String>>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let email = email.into();
        tokio::spawn(async move {
            match inner.fetch_providers(&email) {
                Ok(providers) => inner.futures.complete(handle, providers),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.fetch_providers.set(&future);
        future
    }

    /// Queue a password reset email for `email`
    pub fn send_password_reset_email(&self, email: impl Into<String>) -> Future<()> {
        let future = self.inner.futures.alloc::<()>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let email = email.into();
        tokio::spawn(async move {
            match inner.send_password_reset(&email) {
                Ok(()) => inner.futures.complete(handle, ()),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.send_password_reset.set(&future);
        future
    }

    /// ID token of the current user
    ///
    /// A cached token is reused until it is close to expiry;
    /// `force_refresh` mints a new one regardless.
    pub fn token(&self, force_refresh: bool) -> Future<String> {
        let future = self.inner.futures.alloc::<String>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.issue_token(force_refresh) {
                Ok(token) => inner.futures.complete(handle, token),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.token.set(&future);
        future
    }

    /// Change the email address of the current user
    ///
    /// For an anonymous user this attaches the address, making the account
    /// permanent.
    pub fn update_email(&self, email: impl Into<String>) -> Future<()> {
        let future = self.inner.futures.alloc::<()>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let email = email.into();
        tokio::spawn(async move {
            match inner.update_email(&email) {
                Ok(()) => inner.futures.complete(handle, ()),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.update_user.set(&future);
        future
    }

    /// Change the password of the current user
    pub fn update_password(&self, password: impl Into<String>) -> Future<()> {
        let future = self.inner.futures.alloc::<()>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        let password = password.into();
        tokio::spawn(async move {
            match inner.update_password(&password) {
                Ok(()) => inner.futures.complete(handle, ()),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.update_user.set(&future);
        future
    }

    /// Update the display name and photo URL of the current user
    pub fn update_user_profile(&self, profile: UserProfile) -> Future<()> {
        let future = self.inner.futures.alloc::<()>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.update_profile(profile) {
                Ok(()) => inner.futures.complete(handle, ()),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.update_user.set(&future);
        future
    }

    /// Delete the account of the current user and sign out
    pub fn delete_user(&self) -> Future<()> {
        let future = self.inner.futures.alloc::<()>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.delete_current_user() {
                Ok(()) => inner.futures.complete(handle, ()),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.delete_user.set(&future);
        future
    }

    /// Register an observer of sign-in state
    ///
    /// The listener is called with the current state before this returns, and
    /// stays registered for as long as the returned registration is held.
    pub fn add_auth_state_listener(
        &self,
        listener: Arc<dyn AuthStateListener>,
    ) -> AuthStateListenerRegistration {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::clone(&listener)));

        let current = self.current_user();
        listener.on_auth_state_changed(current.as_deref());

        AuthStateListenerRegistration {
            auth: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Subscribe to authentication state changes
    ///
    /// The stream yields the current state immediately, then the user after
    /// every sign-in and `None` after every sign-out.
    ///
    /// # Example
    /// ```no_run
    /// # async fn example(auth: nimbus_sdk::Auth) {
    /// use futures::StreamExt;
    ///
    /// let mut stream = auth.auth_state_changes();
    /// while let Some(user) = stream.next().await {
    ///     match user {
    ///         Some(u) => println!("User signed in: {}", u.uid),
    ///         None => println!("User signed out"),
    ///     }
    /// }
    /// # }
    /// ```
    pub fn auth_state_changes(&self) -> Pin<Box<dyn Stream<Item = Option<Arc<User>>> + Send>> {
        let initial_user = self.current_user();
        let mut rx = self.inner.state_tx.subscribe();

        Box::pin(stream! {
            // Yield initial state first
            yield initial_user;

            loop {
                let user = match rx.recv().await {
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Ok(u) => u,
                };
                yield user;
            }
        })
    }

    /// Future of the most recent [`sign_in_anonymously`](Self::sign_in_anonymously) call
    pub fn sign_in_anonymously_last_result(&self) -> Future<User> {
        self.inner.last.sign_in_anonymously.get()
    }

    /// Future of the most recent
    /// [`sign_in_with_email_and_password`](Self::sign_in_with_email_and_password) call
    pub fn sign_in_with_email_and_password_last_result(&self) -> Future<User> {
        self.inner.last.sign_in_with_email.get()
    }

    /// Future of the most recent
    /// [`create_user_with_email_and_password`](Self::create_user_with_email_and_password) call
    pub fn create_user_with_email_and_password_last_result(&self) -> Future<User> {
        self.inner.last.create_user.get()
    }

    /// Future of the most recent [`sign_in_with_credential`](Self::sign_in_with_credential) call
    pub fn sign_in_with_credential_last_result(&self) -> Future<AuthResult> {
        self.inner.last.sign_in_with_credential.get()
    }

    /// Future of the most recent
    /// [`sign_in_with_custom_token`](Self::sign_in_with_custom_token) call
    pub fn sign_in_with_custom_token_last_result(&self) -> Future<User> {
        self.inner.last.sign_in_with_custom_token.get()
    }

    /// Future of the most recent [`fetch_providers_for_email`](Self::fetch_providers_for_email) call
    pub fn fetch_providers_for_email_last_result(&self) -> Future<Vec<String>> {
        self.inner.last.fetch_providers.get()
    }

    /// Future of the most recent [`send_password_reset_email`](Self::send_password_reset_email) call
    pub fn send_password_reset_email_last_result(&self) -> Future<()> {
        self.inner.last.send_password_reset.get()
    }

    /// Future of the most recent [`token`](Self::token) call
    pub fn token_last_result(&self) -> Future<String> {
        self.inner.last.token.get()
    }

    /// Future of the most recent email, password or profile update
    pub fn update_user_last_result(&self) -> Future<()> {
        self.inner.last.update_user.get()
    }

    /// Future of the most recent [`delete_user`](Self::delete_user) call
    pub fn delete_user_last_result(&self) -> Future<()> {
        self.inner.last.delete_user.get()
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("app_name", &self.inner.app_name)
            .field("api_key", &"<redacted>")
            .field(
                "current_user",
                &self.current_user().map(|user| user.uid.clone()),
            )
            .finish()
    }
}

impl AuthInner {
    fn ensure_active(&self) -> Result<(), AuthError> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(AuthError::Failure(
                "auth instance was deleted".to_string(),
            ));
        }
        Ok(())
    }

    fn set_current_user(&self, user: Option<Arc<User>>) {
        {
            let mut current = self
                .current_user
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *current = user.clone();
        }
        // The cached token belongs to the previous sign-in state.
        *self
            .issued_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        // Broadcast state change (ignore error if no listeners)
        let _ = self.state_tx.send(user.clone());
        self.notify_listeners(user.as_deref());
    }

    fn notify_listeners(&self, user: Option<&User>) {
        // Listeners run outside the lock; one may remove itself re-entrantly.
        let snapshot: Vec<Arc<dyn AuthStateListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener.on_auth_state_changed(user);
        }
    }

    fn refresh_current_user(&self, user: User) {
        let mut current = self
            .current_user
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = Some(Arc::new(user));
    }

    fn anonymous_sign_in(&self) -> Result<User, AuthError> {
        self.ensure_active()?;
        let now = Utc::now().timestamp_millis();
        let user = User {
            uid: format!("anon-{}", Uuid::new_v4().simple()),
            email: None,
            display_name: None,
            photo_url: None,
            email_verified: false,
            is_anonymous: true,
            metadata: UserMetadata {
                creation_timestamp: now,
                last_sign_in_timestamp: now,
            },
            provider_data: Vec::new(),
        };
        self.set_current_user(Some(Arc::new(user.clone())));
        debug!(app = %self.app_name, uid = %user.uid, "anonymous sign-in");
        Ok(user)
    }

    fn password_sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
        self.ensure_active()?;
        // Validate email (error case first)
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::InvalidEmail);
        }
        // Validate password (error case first)
        if password.is_empty() {
            return Err(AuthError::InvalidPassword);
        }

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let record = users
            .values_mut()
            .find(|record| record.email.as_deref() == Some(email))
            .ok_or(AuthError::UserNotFound)?;

        if record.disabled {
            return Err(AuthError::UserDisabled);
        }
        if record.password.as_deref() != Some(password) {
            return Err(AuthError::WrongPassword);
        }

        record.last_sign_in_timestamp = Utc::now().timestamp_millis();
        let user = record.to_user();
        drop(users);

        self.set_current_user(Some(Arc::new(user.clone())));
        debug!(app = %self.app_name, uid = %user.uid, "password sign-in");
        Ok(user)
    }

    fn create_user(&self, email: &str, password: &str) -> Result<User, AuthError> {
        self.ensure_active()?;
        // Validate email (error case first)
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::InvalidEmail);
        }
        // Passwords shorter than six characters are rejected platform-wide.
        if password.len() < 6 {
            return Err(AuthError::InvalidPassword);
        }

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users
            .values()
            .any(|record| record.email.as_deref() == Some(email))
        {
            return Err(AuthError::EmailAlreadyInUse);
        }

        let now = Utc::now().timestamp_millis();
        let record = AccountRecord {
            uid: format!("user-{}", Uuid::new_v4().simple()),
            email: Some(email.to_string()),
            password: Some(password.to_string()),
            display_name: None,
            photo_url: None,
            email_verified: false,
            disabled: false,
            provider_id: "password".to_string(),
            creation_timestamp: now,
            last_sign_in_timestamp: now,
        };
        let user = record.to_user();
        users.insert(record.uid.clone(), record);
        drop(users);

        self.set_current_user(Some(Arc::new(user.clone())));
        debug!(app = %self.app_name, uid = %user.uid, "created account");
        Ok(user)
    }

    fn credential_sign_in(&self, credential: Credential) -> Result<AuthResult, AuthError> {
        self.ensure_active()?;
        let provider_id = credential.provider_id().to_string();
        let (user, is_new_user) = match credential {
            Credential::EmailPassword { email, password } => {
                (self.password_sign_in(&email, &password)?, false)
            }
            Credential::Anonymous => (self.anonymous_sign_in()?, true),
            Credential::CustomToken { token } => {
                let existed = self.external_account_exists("custom", &token);
                (self.custom_token_sign_in(&token)?, !existed)
            }
            Credential::Google {
                id_token,
                access_token,
            } => {
                let token = id_token.or(access_token).ok_or_else(|| {
                    AuthError::InvalidCredential("google credential is missing a token".to_string())
                })?;
                self.external_sign_in("google.com", &token)?
            }
            Credential::Facebook { access_token } => {
                if access_token.is_empty() {
                    return Err(AuthError::InvalidCredential(
                        "facebook access token is empty".to_string(),
                    ));
                }
                self.external_sign_in("facebook.com", &access_token)?
            }
            Credential::GitHub { token } => {
                if token.is_empty() {
                    return Err(AuthError::InvalidCredential(
                        "github token is empty".to_string(),
                    ));
                }
                self.external_sign_in("github.com", &token)?
            }
            Credential::OAuth {
                provider_id: oauth_provider,
                id_token,
                access_token,
                ..
            } => {
                if oauth_provider.is_empty() {
                    return Err(AuthError::InvalidCredential(
                        "oauth credential has no provider id".to_string(),
                    ));
                }
                let token = id_token.or(access_token).ok_or_else(|| {
                    AuthError::InvalidCredential("oauth credential is missing a token".to_string())
                })?;
                self.external_sign_in(&oauth_provider, &token)?
            }
        };

        Ok(AuthResult {
            user: Arc::new(user),
            additional_user_info: Some(AdditionalUserInfo {
                provider_id,
                is_new_user,
                profile: None,
            }),
        })
    }

    fn custom_token_sign_in(&self, token: &str) -> Result<User, AuthError> {
        self.ensure_active()?;
        // Validate token (error case first)
        if token.is_empty() {
            return Err(AuthError::InvalidCredential(
                "custom token is empty".to_string(),
            ));
        }
        let (user, _) = self.external_sign_in("custom", token)?;
        Ok(user)
    }

    /// Sign in an account derived from an external provider token
    ///
    /// The token is not verified; federating with the real provider is the
    /// application backend's job. The same (provider, token) pair always maps
    /// to the same account.
    fn external_sign_in(&self, provider_id: &str, token: &str) -> Result<(User, bool), AuthError> {
        let uid = derive_external_uid(provider_id, token);
        let now = Utc::now().timestamp_millis();

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let is_new_user = !users.contains_key(&uid);
        let record = users.entry(uid.clone()).or_insert_with(|| AccountRecord {
            uid: uid.clone(),
            email: None,
            password: None,
            display_name: None,
            photo_url: None,
            email_verified: false,
            disabled: false,
            provider_id: provider_id.to_string(),
            creation_timestamp: now,
            last_sign_in_timestamp: now,
        });
        if record.disabled {
            return Err(AuthError::UserDisabled);
        }
        record.last_sign_in_timestamp = now;
        let user = record.to_user();
        drop(users);

        self.set_current_user(Some(Arc::new(user.clone())));
        debug!(app = %self.app_name, uid = %user.uid, provider = provider_id, "external sign-in");
        Ok((user, is_new_user))
    }

    fn external_account_exists(&self, provider_id: &str, token: &str) -> bool {
        let uid = derive_external_uid(provider_id, token);
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&uid)
    }

    fn fetch_providers(&self, email: &str) -> Result<Vec<String>, AuthError> {
        self.ensure_active()?;
        // Validate email (error case first)
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::InvalidEmail);
        }
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        Ok(users
            .values()
            .filter(|record| record.email.as_deref() == Some(email))
            .map(|record| record.provider_id.clone())
            .collect())
    }

    fn send_password_reset(&self, email: &str) -> Result<(), AuthError> {
        self.ensure_active()?;
        // Validate email (error case first)
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::InvalidEmail);
        }
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        let known = users
            .values()
            .any(|record| record.email.as_deref() == Some(email));
        if !known {
            return Err(AuthError::UserNotFound);
        }
        debug!(app = %self.app_name, email, "password reset email queued");
        Ok(())
    }

    fn issue_token(&self, force_refresh: bool) -> Result<String, AuthError> {
        self.ensure_active()?;
        let user = self
            .current_user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AuthError::NoSignedInUser)?;

        let now = Utc::now().timestamp();
        if !force_refresh {
            let cached = self
                .issued_token
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(token) = cached.as_ref() {
                if now < token.expires_at - TOKEN_REFRESH_WINDOW_SECS {
                    return Ok(token.value.clone());
                }
            }
        }

        let expires_at = now + TOKEN_LIFETIME_SECS;
        let header = json!({ "alg": "none", "typ": "JWT" });
        let claims = json!({
            "sub": user.uid,
            "iss": "nimbus-auth",
            "aud": self.app_name,
            "iat": now,
            "exp": expires_at,
            "jti": Uuid::new_v4().to_string(),
        });
        let value = format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string()),
            URL_SAFE_NO_PAD.encode("unsigned"),
        );

        *self
            .issued_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(IssuedToken {
            value: value.clone(),
            expires_at,
        });
        Ok(value)
    }

    fn update_email(&self, email: &str) -> Result<(), AuthError> {
        self.ensure_active()?;
        let user = self.require_current_user()?;
        // Validate email (error case first)
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::InvalidEmail);
        }

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users
            .values()
            .any(|record| record.uid != user.uid && record.email.as_deref() == Some(email))
        {
            return Err(AuthError::EmailAlreadyInUse);
        }

        let record = Self::account_entry(&mut users, &user);
        record.email = Some(email.to_string());
        record.email_verified = false;
        record.provider_id = "password".to_string();
        let updated = record.to_user();
        drop(users);

        self.refresh_current_user(updated);
        Ok(())
    }

    fn update_password(&self, password: &str) -> Result<(), AuthError> {
        self.ensure_active()?;
        let user = self.require_current_user()?;
        if password.len() < 6 {
            return Err(AuthError::InvalidPassword);
        }

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let record = Self::account_entry(&mut users, &user);
        record.password = Some(password.to_string());
        let updated = record.to_user();
        drop(users);

        self.refresh_current_user(updated);
        Ok(())
    }

    fn update_profile(&self, profile: UserProfile) -> Result<(), AuthError> {
        self.ensure_active()?;
        let user = self.require_current_user()?;

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let record = Self::account_entry(&mut users, &user);
        if let Some(display_name) = profile.display_name {
            record.display_name = Some(display_name);
        }
        if let Some(photo_url) = profile.photo_url {
            record.photo_url = Some(photo_url);
        }
        let updated = record.to_user();
        drop(users);

        self.refresh_current_user(updated);
        Ok(())
    }

    fn delete_current_user(&self) -> Result<(), AuthError> {
        self.ensure_active()?;
        let user = self.require_current_user()?;

        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user.uid);
        self.set_current_user(None);
        debug!(app = %self.app_name, uid = %user.uid, "deleted account");
        Ok(())
    }

    fn require_current_user(&self) -> Result<Arc<User>, AuthError> {
        self.current_user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AuthError::NoSignedInUser)
    }

    /// Account record backing `user`, created on first mutation for accounts
    /// that sign-in alone never stores (anonymous users)
    fn account_entry<'a>(
        users: &'a mut HashMap<String, AccountRecord>,
        user: &User,
    ) -> &'a mut AccountRecord {
        users.entry(user.uid.clone()).or_insert_with(|| AccountRecord {
            uid: user.uid.clone(),
            email: user.email.clone(),
            password: None,
            display_name: user.display_name.clone(),
            photo_url: user.photo_url.clone(),
            email_verified: user.email_verified,
            disabled: false,
            provider_id: "password".to_string(),
            creation_timestamp: user.metadata.creation_timestamp,
            last_sign_in_timestamp: user.metadata.last_sign_in_timestamp,
        })
    }
}

impl AccountRecord {
    fn to_user(&self) -> User {
        User {
            uid: self.uid.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            photo_url: self.photo_url.clone(),
            email_verified: self.email_verified,
            is_anonymous: false,
            metadata: UserMetadata {
                creation_timestamp: self.creation_timestamp,
                last_sign_in_timestamp: self.last_sign_in_timestamp,
            },
            provider_data: vec![UserInfo {
                uid: self.uid.clone(),
                display_name: self.display_name.clone(),
                email: self.email.clone(),
                photo_url: self.photo_url.clone(),
                provider_id: self.provider_id.clone(),
            }],
        }
    }
}

/// Stable account ID for an external (provider or custom token) identity
fn derive_external_uid(provider_id: &str, token: &str) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(format!("{}:{}", provider_id, token));
    // The suffix varies with the token tail, the prefix only with the
    // provider; keep the suffix.
    let start = encoded.len().saturating_sub(24);
    format!("ext-{}", &encoded[start..])
}

/// Tear down the Auth instance created for `app_name`
///
/// Called by [`App::delete_app`](crate::App::delete_app). Listeners stop
/// being invoked and subsequent operations fail.
pub(crate) async fn purge_instance(app_name: &str) {
    let removed = AUTH_INSTANCES.write().await.remove(app_name);
    if let Some(auth) = removed {
        auth.inner.deleted.store(true, Ordering::SeqCst);
        auth.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *auth
            .inner
            .current_user
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        debug!(app = %app_name, "purged auth instance");
    }
}
