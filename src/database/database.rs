//! Database entry point and per-app instance management

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::RwLock;
use tracing::debug;

use crate::app::App;
use crate::database::backend::{DatabaseBackend, MemoryBackend};
use crate::database::data_snapshot::DataSnapshot;
use crate::database::reference::DatabaseReference;
use crate::database::value;
use crate::error::DatabaseError;
use crate::future::{FutureRegistry, LastResult};

/// Global map of "app name|url" keys to Database instances
static DATABASE_INSTANCES: Lazy<RwLock<HashMap<String, Database>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Entry point to one realtime database tree
///
/// Each (app, url) pair has at most one registered instance; repeated
/// [`get_instance`](Database::get_instance) calls return the same one.
/// Instances are cheap to clone and share their state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

pub(crate) struct DatabaseInner {
    pub(crate) app_name: String,
    pub(crate) url: String,
    pub(crate) backend: Arc<dyn DatabaseBackend>,
    pub(crate) futures: Arc<FutureRegistry>,
    pub(crate) last: LastResults,
}

/// Most recent future per operation kind, shared by every reference of one
/// database instance
#[derive(Default)]
pub(crate) struct LastResults {
    pub(crate) get_value: LastResult<DataSnapshot>,
    pub(crate) set_value: LastResult<()>,
    pub(crate) update_children: LastResult<()>,
    pub(crate) remove_value: LastResult<()>,
    pub(crate) run_transaction: LastResult<DataSnapshot>,
}

impl Database {
    /// Get the database instance for `app` at its configured URL
    pub async fn get_instance(app: &App) -> Result<Self, DatabaseError> {
        Self::get_instance_with_url(app, &app.database_url()).await
    }

    /// Get the database instance for `app` at an explicit URL
    pub async fn get_instance_with_url(app: &App, url: &str) -> Result<Self, DatabaseError> {
        // Validate the url (error case first)
        if url.is_empty() {
            return Err(DatabaseError::OperationFailed(
                "database URL is empty".to_string(),
            ));
        }

        let key = format!("{}|{}", app.name(), url);
        let mut instances = DATABASE_INSTANCES.write().await;

        // Check if instance already exists
        if let Some(database) = instances.get(&key) {
            return Ok(database.clone());
        }

        let database = Database {
            inner: Arc::new(DatabaseInner {
                app_name: app.name().to_string(),
                url: url.to_string(),
                backend: Arc::new(MemoryBackend::new()),
                futures: Arc::new(FutureRegistry::new()),
                last: LastResults::default(),
            }),
        };

        debug!(app = %app.name(), url, "created database instance");
        instances.insert(key, database.clone());

        Ok(database)
    }

    /// Build a database instance on a caller-supplied backend
    ///
    /// The instance is not registered: [`get_instance`](Database::get_instance)
    /// will not return it and [`App::delete_app`] will not shut it down. The
    /// caller owns its lifecycle, which makes this the seam for tests and
    /// embedders.
    pub fn with_backend(app: &App, backend: Arc<dyn DatabaseBackend>) -> Self {
        Database {
            inner: Arc::new(DatabaseInner {
                app_name: app.name().to_string(),
                url: app.database_url(),
                backend,
                futures: Arc::new(FutureRegistry::new()),
                last: LastResults::default(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<DatabaseInner>) -> Self {
        Database { inner }
    }

    /// Name of the app this instance belongs to
    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    /// URL of the tree this instance talks to
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// A reference to the tree root
    pub fn reference(&self) -> DatabaseReference {
        DatabaseReference::new(Arc::clone(&self.inner), String::new())
    }

    /// A reference to the location at `path`
    pub fn reference_from_path(&self, path: &str) -> Result<DatabaseReference, DatabaseError> {
        let segments = value::split_path(path)?;
        Ok(DatabaseReference::new(
            Arc::clone(&self.inner),
            segments.join("/"),
        ))
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("app_name", &self.inner.app_name)
            .field("url", &self.inner.url)
            .finish()
    }
}

/// Tear down every database instance created for `app_name`
///
/// Called by [`App::delete_app`]. Closing a backend fails the in-flight
/// operations of that instance with [`DatabaseError::Disconnected`] and
/// cancels its value listeners.
pub(crate) async fn purge_instance(app_name: &str) {
    let removed: Vec<Database> = {
        let mut instances = DATABASE_INSTANCES.write().await;
        let keys: Vec<String> = instances
            .keys()
            .filter(|key| key.split('|').next() == Some(app_name))
            .cloned()
            .collect();
        keys.iter().filter_map(|key| instances.remove(key)).collect()
    };
    for database in removed {
        database.inner.backend.close().await;
        debug!(app = %app_name, url = %database.inner.url, "closed database instance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppOptions;
    use serde_json::json;

    async fn test_app(name: &str) -> App {
        App::create(AppOptions {
            api_key: format!("api-key-{}", name),
            project_id: format!("project-{}", name),
            app_name: Some(name.to_string()),
            ..Default::default()
        })
        .await
        .expect("Failed to create app")
    }

    #[tokio::test]
    async fn test_get_instance_is_singleton_per_url() {
        let app = test_app("db-singleton").await;

        let first = Database::get_instance(&app).await.expect("first instance");
        let second = Database::get_instance(&app).await.expect("second lookup");
        assert!(Arc::ptr_eq(&first.inner, &second.inner));

        let other = Database::get_instance_with_url(&app, "https://other.db.nimbus.dev")
            .await
            .expect("instance at explicit url");
        assert!(!Arc::ptr_eq(&first.inner, &other.inner));
        assert_eq!(other.url(), "https://other.db.nimbus.dev");
    }

    #[tokio::test]
    async fn test_empty_url_is_rejected() {
        let app = test_app("db-empty-url").await;
        assert!(Database::get_instance_with_url(&app, "").await.is_err());
    }

    #[tokio::test]
    async fn test_reference_from_path_validates() {
        let app = test_app("db-paths").await;
        let database = Database::get_instance(&app).await.expect("instance");

        let reference = database
            .reference_from_path("/users/alice/")
            .expect("valid path");
        assert_eq!(reference.path(), "/users/alice");
        assert_eq!(reference.database().url(), database.url());

        assert!(database.reference_from_path("users//alice").is_err());
        assert!(database.reference_from_path("users/$alice").is_err());
    }

    #[tokio::test]
    async fn test_instances_do_not_share_state() {
        let app = test_app("db-isolated").await;
        let first = Database::get_instance(&app).await.expect("instance");
        let second = Database::get_instance_with_url(&app, "https://second.db.nimbus.dev")
            .await
            .expect("instance");

        first
            .reference()
            .child("shared")
            .set_value(1)
            .await
            .expect("write should succeed");

        let snapshot = second
            .reference()
            .child("shared")
            .get_value()
            .await
            .expect("get should succeed");
        assert!(!snapshot.exists());
    }

    #[tokio::test]
    async fn test_purge_closes_backends() {
        let app = test_app("db-purged").await;
        let database = Database::get_instance(&app).await.expect("instance");
        database
            .reference()
            .child("value")
            .set_value(json!(1))
            .await
            .expect("write should succeed");

        purge_instance("db-purged").await;

        let err = database
            .reference()
            .child("value")
            .get_value()
            .await
            .expect_err("closed backend must fail reads");
        assert_eq!(err.code, DatabaseError::Disconnected.code());

        let fresh = Database::get_instance(&app).await.expect("re-created instance");
        assert!(!Arc::ptr_eq(&database.inner, &fresh.inner));
    }
}
