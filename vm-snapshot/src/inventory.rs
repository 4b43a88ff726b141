//! Name to inventory-reference resolution.
//!
//! Names are not unique in vSphere, so resolution either yields exactly one
//! reference or fails with every candidate listed. Single matches are cached
//! for a short TTL; clone creation and removal invalidate affected entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use vm_config::RetryPolicy;
use vm_core::error::{ObjectKind, Result, VmError};
use vm_provider::call::read_with_retry;
use vm_provider::{CallContext, Gateway, InventoryRef};

#[derive(Debug, Clone)]
struct CacheEntry {
    vm: InventoryRef,
    resolved_at: Instant,
}

pub struct InventoryResolver {
    gateway: Arc<dyn Gateway>,
    default_datacenter: String,
    ttl: Duration,
    retry: RetryPolicy,
    cache: Mutex<HashMap<(String, String), CacheEntry>>,
}

impl InventoryResolver {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        default_datacenter: impl Into<String>,
        ttl: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            default_datacenter: default_datacenter.into(),
            ttl,
            retry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_datacenter(&self) -> &str {
        &self.default_datacenter
    }

    /// Resolve a VM by exact name. An empty datacenter means the configured
    /// default.
    pub async fn resolve(
        &self,
        ctx: &CallContext,
        datacenter: &str,
        name: &str,
    ) -> Result<InventoryRef> {
        if name.trim().is_empty() {
            return Err(VmError::InvalidInput("VM name must not be empty".into()));
        }
        let datacenter = if datacenter.trim().is_empty() {
            self.default_datacenter.as_str()
        } else {
            datacenter
        };
        let key = (datacenter.to_string(), name.to_string());

        if let Some(vm) = self.cached(&key) {
            debug!(datacenter, name, vm = %vm, "resolved VM from cache");
            return Ok(vm);
        }

        let mut matches = read_with_retry(ctx, &self.retry, "findVmByName", || {
            self.gateway.find_vm_by_name(datacenter, name)
        })
        .await?;

        match matches.len() {
            0 => Err(VmError::not_found(
                ObjectKind::Vm,
                format!("{}/{}", datacenter, name),
            )),
            1 => {
                let vm = matches.remove(0);
                info!(datacenter, name, vm = %vm, "resolved VM");
                self.lock().insert(
                    key,
                    CacheEntry {
                        vm: vm.clone(),
                        resolved_at: Instant::now(),
                    },
                );
                Ok(vm)
            }
            _ => {
                let mut candidates: Vec<String> = matches.into_iter().map(|m| m.id).collect();
                candidates.sort();
                Err(VmError::Ambiguous {
                    kind: ObjectKind::Vm,
                    name: name.to_string(),
                    candidates,
                })
            }
        }
    }

    /// Drop the cached entry for one name.
    pub fn invalidate(&self, datacenter: &str, name: &str) {
        let datacenter = if datacenter.trim().is_empty() {
            self.default_datacenter.as_str()
        } else {
            datacenter
        };
        self.lock()
            .remove(&(datacenter.to_string(), name.to_string()));
    }

    /// Drop every cached entry pointing at `vm_id`, or sharing its name.
    pub fn invalidate_ref(&self, vm: &InventoryRef) {
        self.lock()
            .retain(|(_, name), entry| entry.vm.id != vm.id && *name != vm.name);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn cached(&self, key: &(String, String)) -> Option<InventoryRef> {
        let mut cache = self.lock();
        match cache.get(key) {
            Some(entry) if entry.resolved_at.elapsed() < self.ttl => Some(entry.vm.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), CacheEntry>> {
        // A poisoned cache only holds stale lookups; keep using it.
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}
