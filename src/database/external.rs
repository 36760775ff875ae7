//! Externally managed database provider
//!
//! The operator provisions nothing here: an administrator owns the database
//! server and hands the operator a connection Secret. Connection facts start
//! from the Site spec, then any field present in the referenced Secret
//! overrides it, then hard defaults fill the rest. A site with no resolvable
//! host is a configuration error rather than a hung reconcile.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use tracing::debug;

use super::{DatabaseCredentials, DatabaseInfo, DatabaseProvider, ResourceStore};
use crate::crd::Site;
use crate::{Error, Result};

/// Default port when neither spec nor secret provide one
const DEFAULT_PORT: &str = "3306";

/// Provider for databases managed outside the cluster
pub struct ExternalProvider {
    store: Arc<dyn ResourceStore>,
}

impl ExternalProvider {
    /// Create a provider over the given resource store
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    fn namespace(site: &Site) -> Result<&str> {
        site.metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::configuration("site is missing metadata.namespace"))
    }

    /// Flatten both data and stringData into readable strings
    fn secret_values(secret: &Secret) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        if let Some(data) = &secret.data {
            for (key, bytes) in data {
                values.insert(key.clone(), String::from_utf8_lossy(&bytes.0).to_string());
            }
        }
        if let Some(string_data) = &secret.string_data {
            for (key, value) in string_data {
                values.insert(key.clone(), value.clone());
            }
        }
        values
    }

    async fn connection_secret(&self, site: &Site) -> Result<Option<BTreeMap<String, String>>> {
        let config = site.spec.database_config();
        let Some(secret_ref) = &config.connection_secret_ref else {
            return Ok(None);
        };
        let namespace = Self::namespace(site)?;
        let secret = self
            .store
            .get_secret(namespace, &secret_ref.name)
            .await?
            .ok_or_else(|| {
                Error::configuration(format!(
                    "connection secret '{}' not found in namespace '{namespace}'",
                    secret_ref.name
                ))
            })?;
        Ok(Some(Self::secret_values(&secret)))
    }
}

#[async_trait]
impl DatabaseProvider for ExternalProvider {
    async fn ensure_database(&self, site: &Site) -> Result<DatabaseInfo> {
        let config = site.spec.database_config();
        let secret = self.connection_secret(site).await?;
        let secret = secret.as_ref();

        // The secret overrides the spec, field by field; the administrator's
        // handed-out connection facts are authoritative
        let host = secret
            .and_then(|s| s.get("host").cloned())
            .or_else(|| config.host.clone())
            .ok_or_else(|| {
                Error::configuration(
                    "database host is required (either in spec or secret) for external databases",
                )
            })?;
        let port = secret
            .and_then(|s| s.get("port").cloned())
            .or_else(|| config.port.clone())
            .unwrap_or_else(|| DEFAULT_PORT.to_string());
        let name = secret
            .and_then(|s| s.get("database").cloned())
            .unwrap_or_else(|| site.spec.site_name.clone());
        let provider = secret
            .and_then(|s| s.get("type").cloned())
            .unwrap_or_else(|| "mariadb".to_string());

        debug!(%host, %port, database = %name, "resolved external database connection");
        Ok(DatabaseInfo {
            host,
            port,
            name,
            provider,
        })
    }

    async fn is_ready(&self, site: &Site) -> Result<bool> {
        let config = site.spec.database_config();

        // With a secret reference, readiness means the secret exists; without
        // one, a spec host is taken at face value.
        if let Some(secret_ref) = &config.connection_secret_ref {
            let namespace = Self::namespace(site)?;
            return Ok(self
                .store
                .get_secret(namespace, &secret_ref.name)
                .await?
                .is_some());
        }
        if config.host.is_some() {
            return Ok(true);
        }
        Err(Error::configuration(
            "external database requires either connectionSecretRef or an explicit host",
        ))
    }

    async fn get_credentials(&self, site: &Site) -> Result<DatabaseCredentials> {
        let config = site.spec.database_config();
        let secret_ref = config.connection_secret_ref.as_ref().ok_or_else(|| {
            Error::configuration(
                "external database credentials require connectionSecretRef",
            )
        })?;
        let values = self
            .connection_secret(site)
            .await?
            .ok_or_else(|| Error::configuration("connection secret reference lost mid-pass"))?;

        let username = values.get("username").cloned().ok_or_else(|| {
            Error::configuration(format!(
                "connection secret '{}' has no 'username' key",
                secret_ref.name
            ))
        })?;
        let password = values.get("password").cloned().ok_or_else(|| {
            Error::configuration(format!(
                "connection secret '{}' has no 'password' key",
                secret_ref.name
            ))
        })?;

        Ok(DatabaseCredentials {
            username,
            password,
            secret_name: secret_ref.name.clone(),
        })
    }

    async fn cleanup(&self, _site: &Site) -> Result<()> {
        // The database is administrator-owned; the operator never drops it
        Ok(())
    }
}
