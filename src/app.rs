//! Nimbus App
//!
//! The App is the central configuration object for Nimbus services. It holds
//! the credentials and project configuration that Auth, Database, Storage and
//! Messaging read, and it owns the lifetime of those per-app service
//! instances: deleting an app tears all of them down.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::NimbusError;

/// Global map of App names to App instances
static APP_INSTANCES: Lazy<RwLock<HashMap<String, App>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Name used when [`AppOptions::app_name`] is not set
pub const DEFAULT_APP_NAME: &str = "[DEFAULT]";

/// Nimbus App instance
///
/// Each app name has at most one App instance (singleton pattern); creating
/// an app under an existing name returns the existing instance.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    name: String,
    options: AppOptions,
}

/// Nimbus App configuration options
///
/// Only `api_key` and `project_id` are required; the service-specific fields
/// fall back to values derived from the project id.
#[derive(Clone, Default)]
pub struct AppOptions {
    /// Nimbus API key
    pub api_key: String,
    /// Nimbus project ID
    pub project_id: String,
    /// Application ID (optional)
    pub app_id: Option<String>,
    /// Realtime database URL (optional, derived from the project id)
    pub database_url: Option<String>,
    /// Push messaging sender ID (optional)
    pub messaging_sender_id: Option<String>,
    /// Cloud storage bucket (optional, derived from the project id)
    pub storage_bucket: Option<String>,
    /// App name (optional, defaults to "[DEFAULT]")
    pub app_name: Option<String>,
}

impl fmt::Debug for AppOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppOptions")
            .field("api_key", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("app_id", &self.app_id)
            .field("database_url", &self.database_url)
            .field("messaging_sender_id", &self.messaging_sender_id)
            .field("storage_bucket", &self.storage_bucket)
            .field("app_name", &self.app_name)
            .finish()
    }
}

impl App {
    /// Create a new Nimbus App with the given options
    ///
    /// If an app with the same name already exists, returns the existing
    /// instance.
    ///
    /// # Example
    /// ```no_run
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// use nimbus_sdk::{App, AppOptions};
    ///
    /// let options = AppOptions {
    ///     api_key: "YOUR_API_KEY".to_string(),
    ///     project_id: "your-project-id".to_string(),
    ///     ..Default::default()
    /// };
    /// let app = App::create(options).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn create(options: AppOptions) -> Result<Self, NimbusError> {
        // Validate options (error case first)
        if options.api_key.is_empty() {
            return Err(NimbusError::ApiKeyNotConfigured);
        }
        if options.project_id.is_empty() {
            return Err(NimbusError::Internal(
                "Project ID cannot be empty".to_string(),
            ));
        }

        let name = match options.app_name.clone() {
            None => DEFAULT_APP_NAME.to_string(),
            Some(n) => n,
        };

        let mut instances = APP_INSTANCES.write().await;

        // Check if instance already exists
        if let Some(app) = instances.get(&name) {
            return Ok(app.clone());
        }

        let app = App {
            inner: Arc::new(AppInner {
                name: name.clone(),
                options,
            }),
        };

        debug!(app = %name, "created app instance");
        instances.insert(name, app.clone());

        Ok(app)
    }

    /// Create a new Nimbus App under an explicit name
    ///
    /// Overrides any name carried in `options`.
    pub async fn create_with_name(options: AppOptions, name: &str) -> Result<Self, NimbusError> {
        Self::create(AppOptions {
            app_name: Some(name.to_string()),
            ..options
        })
        .await
    }

    /// Get the default Nimbus App instance
    ///
    /// Returns the app with name "[DEFAULT]" if it exists.
    pub async fn get_instance() -> Result<Self, NimbusError> {
        let instances = APP_INSTANCES.read().await;
        instances.get(DEFAULT_APP_NAME).cloned().ok_or_else(|| {
            NimbusError::Internal(
                "Default Nimbus App not initialized. Call App::create() first.".to_string(),
            )
        })
    }

    /// Get a named Nimbus App instance
    pub async fn get_instance_with_name(name: &str) -> Result<Self, NimbusError> {
        let instances = APP_INSTANCES.read().await;
        instances.get(name).cloned().ok_or_else(|| {
            NimbusError::Internal(format!(
                "Nimbus App '{}' not found. Call App::create() first.",
                name
            ))
        })
    }

    /// Delete an app and tear down its service instances
    ///
    /// Removes the app from the process-wide registry and purges the Auth,
    /// Database, Storage and Messaging instances created for it; their
    /// listeners stop being invoked and their in-flight operations resolve
    /// with an error where the service supports it. Existing clones of the
    /// `App` value stay usable as plain configuration handles.
    pub async fn delete_app(app: App) {
        let name = app.inner.name.clone();
        APP_INSTANCES.write().await.remove(&name);

        crate::auth::purge_instance(&name).await;
        crate::database::purge_instance(&name).await;
        crate::storage::purge_instance(&name).await;
        crate::messaging::purge_instance(&name).await;
        debug!(app = %name, "deleted app instance");
    }

    /// Get the app name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the app options
    pub fn options(&self) -> &AppOptions {
        &self.inner.options
    }

    /// Realtime database URL for this app, derived from the project id when
    /// not configured explicitly
    pub fn database_url(&self) -> String {
        match &self.inner.options.database_url {
            Some(url) => url.clone(),
            None => format!("https://{}.db.nimbus.dev", self.inner.options.project_id),
        }
    }

    /// Cloud storage bucket for this app, derived from the project id when
    /// not configured explicitly
    pub fn storage_bucket(&self) -> String {
        match &self.inner.options.storage_bucket {
            Some(bucket) => bucket.clone(),
            None => format!("{}.storage.nimbus.dev", self.inner.options.project_id),
        }
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .finish()
    }
}
