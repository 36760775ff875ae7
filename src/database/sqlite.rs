//! File-based SQLite provider
//!
//! The database lives on the bench's shared volume, so there is nothing to
//! provision or tear down cluster-side. Useful for development benches and
//! single-site installs.

use async_trait::async_trait;

use super::{DatabaseCredentials, DatabaseInfo, DatabaseProvider};
use crate::crd::Site;
use crate::Result;

/// Provider for file-based SQLite databases
pub struct SqliteProvider;

impl SqliteProvider {
    /// Create the provider
    pub fn new() -> Self {
        Self
    }
}

impl Default for SqliteProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseProvider for SqliteProvider {
    async fn ensure_database(&self, site: &Site) -> Result<DatabaseInfo> {
        // The file is created lazily by the site init job on first use
        Ok(DatabaseInfo {
            host: "localhost".to_string(),
            port: "0".to_string(),
            name: site.spec.site_name.clone(),
            provider: "sqlite".to_string(),
        })
    }

    async fn is_ready(&self, _site: &Site) -> Result<bool> {
        Ok(true)
    }

    async fn get_credentials(&self, site: &Site) -> Result<DatabaseCredentials> {
        Ok(DatabaseCredentials {
            username: site.spec.site_name.clone(),
            password: String::new(),
            secret_name: String::new(),
        })
    }

    async fn cleanup(&self, _site: &Site) -> Result<()> {
        // The file disappears with the volume
        Ok(())
    }
}
