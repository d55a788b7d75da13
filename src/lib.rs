//! Nimbus Rust SDK
//!
//! Async Rust client SDK for the Nimbus app platform: authentication,
//! realtime database, cloud storage and push messaging behind one [`App`].
//!
//! Every asynchronous operation returns a [`Future`] immediately and
//! resolves on a background task; the most recent future of each operation
//! kind stays reachable through the matching `*_last_result()` accessor, so
//! callers may either `.await` the returned future or poll the accessor.
//!
//! # Example (Email/Password Auth)
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use nimbus_sdk::{App, AppOptions, Auth};
//!
//! let app = App::create(AppOptions {
//!     api_key: "YOUR_API_KEY".to_string(),
//!     project_id: "your-project-id".to_string(),
//!     ..Default::default()
//! })
//! .await?;
//!
//! let auth = Auth::get_instance(&app).await?;
//! let user = auth
//!     .sign_in_with_email_and_password("user@example.com", "password")
//!     .await?;
//! println!("Signed in: {}", user.uid);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod app;
pub mod error;
pub mod future;

// Auth module
pub mod auth {
    //! Nimbus Authentication

    pub mod auth;
    pub mod types;

    pub use auth::{Auth, AuthStateListener, AuthStateListenerRegistration};
    pub use types::{
        AdditionalUserInfo, AuthResult, Credential, User, UserInfo, UserMetadata, UserProfile,
    };

    pub(crate) use auth::purge_instance;
}

// Realtime database module
pub mod database;

// Cloud storage module
pub mod storage;

// Messaging module
pub mod messaging {
    //! Nimbus Push Messaging

    pub mod messaging;
    pub mod types;

    pub use messaging::Messaging;
    pub use types::{Message, MessagingListener, Notification};

    pub(crate) use messaging::purge_instance;
}

// Re-exports for convenience
pub use app::{App, AppOptions};
pub use error::{AuthError, DatabaseError, MessagingError, NimbusError, StorageError};
pub use future::{Future, FutureError, FutureHandle, FutureRegistry, FutureStatus};

// Auth re-exports
pub use auth::{Auth, types::{AuthResult, Credential, User}};

// Database re-exports
pub use database::{DataSnapshot, Database, DatabaseReference};

// Storage re-exports
pub use storage::{Storage, StorageReference};

// Messaging re-exports
pub use messaging::{Messaging, types::Message};
