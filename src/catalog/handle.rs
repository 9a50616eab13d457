//! Process-wide catalog handle
//!
//! Readers take an `Arc` snapshot and work on it without holding any lock, so an
//! in-flight request keeps one consistent catalog. A rebuild happens off to the
//! side and is swapped in atomically; a failed rebuild keeps the old catalog.

use super::builder::{CatalogBuilder, SchemaIntrospector};
use super::Catalog;
use crate::error::Result;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

pub struct CatalogHandle {
    current: RwLock<Arc<Catalog>>,
    rebuild_lock: Mutex<()>,
}

impl CatalogHandle {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            current: RwLock::new(Arc::new(catalog)),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Startup initialisation. This is the only catalog failure allowed to be fatal.
    pub fn initialize(builder: &CatalogBuilder, source: &dyn SchemaIntrospector) -> Result<Self> {
        Ok(Self::new(builder.build(source)?))
    }

    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the catalog, returning the previous one.
    pub fn swap(&self, catalog: Catalog) -> Arc<Catalog> {
        let next = Arc::new(catalog);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, next)
    }

    /// Rebuild from the schema and swap. Rebuilds are exclusive.
    pub fn rebuild(
        &self,
        builder: &CatalogBuilder,
        source: &dyn SchemaIntrospector,
    ) -> Result<Arc<Catalog>> {
        let _exclusive = self.rebuild_lock.lock().unwrap_or_else(|e| e.into_inner());

        match builder.build(source) {
            Ok(catalog) => {
                let version = catalog.version.clone();
                self.swap(catalog);
                info!("Catalog swapped to v{}", version);
                Ok(self.snapshot())
            }
            Err(e) => {
                warn!("Catalog rebuild failed, keeping v{}: {}", self.snapshot().version, e);
                Err(e)
            }
        }
    }
}
