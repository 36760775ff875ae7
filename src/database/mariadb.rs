//! Cluster-native MariaDB provider
//!
//! Drives the mariadb-operator's CRs: one `Database`, one `User`, and one
//! `Grant` per site, plus a generated password Secret. Readiness requires all
//! three CRs to report a `Ready` condition of `True`.
//!
//! Shared mode requires an administrator-provisioned shared instance named in
//! `databaseClusterRef`; its absence is surfaced as a precondition failure,
//! never auto-created. Dedicated mode without an explicit reference provisions
//! a private instance for the site.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::DynamicObject;
use kube::core::{GroupVersionKind, ObjectMeta};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info};

use super::{DatabaseCredentials, DatabaseInfo, DatabaseProvider, ResourceStore};
use crate::crd::{DatabaseMode, Site};
use crate::{Error, Result};

const MARIADB_GROUP: &str = "k8s.mariadb.com";
const MARIADB_VERSION: &str = "v1alpha1";

fn gvk(kind: &str) -> GroupVersionKind {
    GroupVersionKind::gvk(MARIADB_GROUP, MARIADB_VERSION, kind)
}

/// Length of generated database passwords
const PASSWORD_LENGTH: usize = 24;

/// Cluster-native MariaDB provider
pub struct MariaDbProvider {
    store: Arc<dyn ResourceStore>,
}

impl MariaDbProvider {
    /// Create a provider over the given resource store
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    fn site_name(site: &Site) -> Result<&str> {
        site.metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::configuration("site is missing metadata.name"))
    }

    fn namespace(site: &Site) -> Result<&str> {
        site.metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::configuration("site is missing metadata.namespace"))
    }

    /// Resolve the backing MariaDB instance name for a site.
    ///
    /// Shared mode demands an explicit reference; dedicated mode falls back
    /// to a per-site instance name.
    fn cluster_name(site: &Site) -> Result<String> {
        let config = site.spec.database_config();
        if let Some(cluster_ref) = &config.database_cluster_ref {
            return Ok(cluster_ref.name.clone());
        }
        match config.mode {
            DatabaseMode::Shared => Err(Error::configuration(
                "shared database mode requires databaseClusterRef: no shared MariaDB instance is \
                 configured for this namespace (administrators must provision one explicitly)",
            )),
            DatabaseMode::Dedicated => {
                let name = Self::site_name(site)?;
                Ok(format!("{name}-mariadb"))
            }
            DatabaseMode::External => Err(Error::configuration(
                "external database mode is not handled by the mariadb provider",
            )),
        }
    }

    /// Logical database/user identifier derived from the site name.
    /// Dots and dashes are not valid in MariaDB identifiers.
    fn db_identifier(site_name: &str) -> String {
        site_name.replace(['.', '-'], "_")
    }

    fn password_secret_name(site_name: &str) -> String {
        format!("{site_name}-db-password")
    }

    async fn ensure_password_secret(&self, site: &Site) -> Result<String> {
        let name = Self::site_name(site)?;
        let namespace = Self::namespace(site)?;
        let secret_name = Self::password_secret_name(name);

        // Reuse an existing password so reapplying never rotates credentials
        if let Some(existing) = self.store.get_secret(namespace, &secret_name).await? {
            if let Some(password) = existing
                .data
                .as_ref()
                .and_then(|d| d.get("password"))
                .map(|bytes| String::from_utf8_lossy(&bytes.0).to_string())
            {
                return Ok(password);
            }
        }

        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LENGTH)
            .map(char::from)
            .collect();

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            string_data: Some(
                [("password".to_string(), password.clone())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        self.store.apply_secret(namespace, &secret).await?;
        debug!(secret = %secret_name, "generated database password secret");
        Ok(password)
    }

    /// True when the object reports a Ready condition with status True
    fn is_object_ready(obj: &DynamicObject) -> bool {
        obj.data
            .get("status")
            .and_then(|s| s.get("conditions"))
            .and_then(|c| c.as_array())
            .map(|conditions| {
                conditions.iter().any(|c| {
                    c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                        && c.get("status").and_then(|s| s.as_str()) == Some("True")
                })
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl DatabaseProvider for MariaDbProvider {
    async fn ensure_database(&self, site: &Site) -> Result<DatabaseInfo> {
        let name = Self::site_name(site)?;
        let namespace = Self::namespace(site)?;
        let cluster = Self::cluster_name(site)?;
        let db_name = Self::db_identifier(&site.spec.site_name);
        let config = site.spec.database_config();

        // Dedicated mode without an explicit reference provisions a private
        // instance alongside the site's database objects.
        if config.mode == DatabaseMode::Dedicated && config.database_cluster_ref.is_none() {
            let instance = json!({
                "apiVersion": format!("{MARIADB_GROUP}/{MARIADB_VERSION}"),
                "kind": "MariaDB",
                "metadata": { "name": cluster, "namespace": namespace },
                "spec": {
                    "replicas": 1,
                    "storage": { "size": "5Gi" },
                },
            });
            self.store
                .apply_dynamic(&gvk("MariaDB"), namespace, &cluster, &instance)
                .await?;
            info!(instance = %cluster, "ensured dedicated mariadb instance");
        }

        let secret_name = Self::password_secret_name(name);
        self.ensure_password_secret(site).await?;

        let database = json!({
            "apiVersion": format!("{MARIADB_GROUP}/{MARIADB_VERSION}"),
            "kind": "Database",
            "metadata": { "name": format!("{name}-db"), "namespace": namespace },
            "spec": {
                "mariaDbRef": { "name": cluster },
                "name": db_name,
                "characterSet": "utf8mb4",
                "collate": "utf8mb4_unicode_ci",
            },
        });
        self.store
            .apply_dynamic(&gvk("Database"), namespace, &format!("{name}-db"), &database)
            .await?;

        let user = json!({
            "apiVersion": format!("{MARIADB_GROUP}/{MARIADB_VERSION}"),
            "kind": "User",
            "metadata": { "name": format!("{name}-user"), "namespace": namespace },
            "spec": {
                "mariaDbRef": { "name": cluster },
                "name": db_name,
                "passwordSecretKeyRef": { "name": secret_name, "key": "password" },
                "host": "%",
            },
        });
        self.store
            .apply_dynamic(&gvk("User"), namespace, &format!("{name}-user"), &user)
            .await?;

        let grant = json!({
            "apiVersion": format!("{MARIADB_GROUP}/{MARIADB_VERSION}"),
            "kind": "Grant",
            "metadata": { "name": format!("{name}-grant"), "namespace": namespace },
            "spec": {
                "mariaDbRef": { "name": cluster },
                "privileges": ["ALL PRIVILEGES"],
                "database": db_name,
                "table": "*",
                "username": db_name,
                "host": "%",
            },
        });
        self.store
            .apply_dynamic(&gvk("Grant"), namespace, &format!("{name}-grant"), &grant)
            .await?;

        Ok(DatabaseInfo {
            host: format!("{cluster}.{namespace}.svc"),
            port: "3306".to_string(),
            name: db_name,
            provider: "mariadb".to_string(),
        })
    }

    async fn is_ready(&self, site: &Site) -> Result<bool> {
        let name = Self::site_name(site)?;
        let namespace = Self::namespace(site)?;

        for (kind, obj_name) in [
            ("Database", format!("{name}-db")),
            ("User", format!("{name}-user")),
            ("Grant", format!("{name}-grant")),
        ] {
            match self.store.get_dynamic(&gvk(kind), namespace, &obj_name).await? {
                Some(obj) if Self::is_object_ready(&obj) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn get_credentials(&self, site: &Site) -> Result<DatabaseCredentials> {
        let name = Self::site_name(site)?;
        let namespace = Self::namespace(site)?;
        let secret_name = Self::password_secret_name(name);

        let secret = self
            .store
            .get_secret(namespace, &secret_name)
            .await?
            .ok_or_else(|| {
                Error::provider(format!("password secret '{secret_name}' not found"))
            })?;

        let password = secret
            .data
            .as_ref()
            .and_then(|d| d.get("password"))
            .map(|bytes| String::from_utf8_lossy(&bytes.0).to_string())
            .or_else(|| {
                secret
                    .string_data
                    .as_ref()
                    .and_then(|d| d.get("password"))
                    .cloned()
            })
            .ok_or_else(|| {
                Error::provider(format!(
                    "password secret '{secret_name}' has no 'password' key"
                ))
            })?;

        Ok(DatabaseCredentials {
            username: Self::db_identifier(&site.spec.site_name),
            password,
            secret_name,
        })
    }

    async fn cleanup(&self, site: &Site) -> Result<()> {
        let name = Self::site_name(site)?;
        let namespace = Self::namespace(site)?;

        // Grant first, then user, then database: revoke access before the
        // objects it refers to disappear.
        self.store
            .delete_dynamic(&gvk("Grant"), namespace, &format!("{name}-grant"))
            .await?;
        self.store
            .delete_dynamic(&gvk("User"), namespace, &format!("{name}-user"))
            .await?;
        self.store
            .delete_dynamic(&gvk("Database"), namespace, &format!("{name}-db"))
            .await?;
        self.store
            .delete_secret(namespace, &Self::password_secret_name(name))
            .await?;

        info!(site = %name, "cleaned up mariadb resources");
        Ok(())
    }
}
