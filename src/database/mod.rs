//! Database provider abstraction
//!
//! A provider implements the four lifecycle capabilities for a Site's backing
//! database: ensure it exists, report readiness, hand out credentials, and
//! clean up on deletion. Variants cover the cluster-native MariaDB operator,
//! externally managed databases, file-based SQLite, and a Postgres stub that
//! fails loudly instead of silently no-opping.
//!
//! Provider selection is a pure function of the Site's database config, so
//! misconfiguration is reported immediately rather than discovered mid-pass.

mod breaker;
mod external;
mod mariadb;
mod sqlite;

pub use breaker::CircuitBreakerProvider;
pub use external::ExternalProvider;
pub use mariadb::MariaDbProvider;
pub use sqlite::SqliteProvider;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;

use crate::crd::{DatabaseConfig, Site};
use crate::{Error, Result, FIELD_MANAGER};

/// Connection facts for a provisioned database. Ephemeral: recomputed per
/// reconciliation, never persisted as a first-class resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseInfo {
    /// Database host
    pub host: String,
    /// Database port
    pub port: String,
    /// Logical database name
    pub name: String,
    /// Provider kind the connection speaks
    pub provider: String,
}

/// Credentials for a provisioned database
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
    /// Secret the credentials came from, when applicable
    pub secret_name: String,
}

impl std::fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("secret_name", &self.secret_name)
            .finish()
    }
}

/// The database lifecycle capability set
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatabaseProvider: Send + Sync {
    /// Provision (or adopt) the database for a site, returning connection facts
    async fn ensure_database(&self, site: &Site) -> Result<DatabaseInfo>;

    /// Whether the backing database is ready for use
    async fn is_ready(&self, site: &Site) -> Result<bool>;

    /// Credentials for connecting to the site's database
    async fn get_credentials(&self, site: &Site) -> Result<DatabaseCredentials>;

    /// Tear down provider-owned resources for a deleted site
    async fn cleanup(&self, site: &Site) -> Result<()>;
}

/// Recognized provider kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    /// Cluster-native MariaDB operator
    MariaDb,
    /// Externally managed database
    External,
    /// File-based SQLite
    Sqlite,
    /// Postgres; selectable but not implemented
    Postgres,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MariaDb => write!(f, "mariadb"),
            Self::External => write!(f, "external"),
            Self::Sqlite => write!(f, "sqlite"),
            Self::Postgres => write!(f, "postgres"),
        }
    }
}

/// Select the provider kind for a database config.
///
/// The explicit `provider` field wins; absent that, a connection secret
/// reference implies an external database; otherwise the cluster-native
/// provider is the default. Unknown kinds are a configuration error, never
/// retried blindly.
pub fn select_provider_kind(config: &DatabaseConfig) -> Result<ProviderKind> {
    if let Some(provider) = config.provider.as_deref() {
        return match provider.to_lowercase().as_str() {
            "mariadb" => Ok(ProviderKind::MariaDb),
            "external" => Ok(ProviderKind::External),
            "sqlite" => Ok(ProviderKind::Sqlite),
            "postgres" => Ok(ProviderKind::Postgres),
            other => Err(Error::configuration(format!(
                "unknown database provider: {other} (expected one of: mariadb, external, sqlite, postgres)"
            ))),
        };
    }

    if config.connection_secret_ref.is_some() {
        return Ok(ProviderKind::External);
    }

    Ok(ProviderKind::MariaDb)
}

/// Build the provider for a kind over the given resource store
pub fn build_provider(kind: ProviderKind, store: Arc<dyn ResourceStore>) -> Arc<dyn DatabaseProvider> {
    match kind {
        ProviderKind::MariaDb => Arc::new(MariaDbProvider::new(store)),
        ProviderKind::External => Arc::new(ExternalProvider::new(store)),
        ProviderKind::Sqlite => Arc::new(SqliteProvider::new()),
        ProviderKind::Postgres => Arc::new(PostgresProvider),
    }
}

/// Postgres provider stub. Every operation fails immediately with a clear
/// "not implemented" error so misrouted sites surface instead of half-working.
pub struct PostgresProvider;

#[async_trait]
impl DatabaseProvider for PostgresProvider {
    async fn ensure_database(&self, _site: &Site) -> Result<DatabaseInfo> {
        Err(Error::not_implemented("postgres database provider"))
    }

    async fn is_ready(&self, _site: &Site) -> Result<bool> {
        Err(Error::not_implemented("postgres database provider"))
    }

    async fn get_credentials(&self, _site: &Site) -> Result<DatabaseCredentials> {
        Err(Error::not_implemented("postgres database provider"))
    }

    async fn cleanup(&self, _site: &Site) -> Result<()> {
        Err(Error::not_implemented("postgres database provider"))
    }
}

// =============================================================================
// Resource store seam
// =============================================================================

/// Narrow view of the cluster resource store the providers need.
///
/// Providers manipulate Secrets and foreign CRs (the MariaDB operator's
/// Database/User/Grant kinds) whose schemas this crate does not own, so the
/// dynamic calls are schema-less by design.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a Secret, None when absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Server-side apply a Secret
    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;

    /// Delete a Secret; absence is success
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// Fetch a schema-less object, None when absent
    async fn get_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Server-side apply a schema-less object
    async fn apply_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<()>;

    /// Delete a schema-less object; absence is success
    async fn delete_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<()>;
}

/// [`ResourceStore`] backed by a real Kubernetes client
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, gvk: &GroupVersionKind, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(gvk);
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

fn ignore_not_found(err: kube::Error) -> Result<()> {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Ok(()),
        other => Err(other.into()),
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::configuration("secret is missing metadata.name"))?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(secret)).await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(e) => ignore_not_found(e),
        }
    }

    async fn get_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.dynamic_api(gvk, namespace).get_opt(name).await?)
    }

    async fn apply_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.dynamic_api(gvk, namespace)
            .patch(name, &params, &Patch::Apply(value))
            .await?;
        Ok(())
    }

    async fn delete_dynamic(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        match self
            .dynamic_api(gvk, namespace)
            .delete(name, &Default::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => ignore_not_found(e),
        }
    }
}
