//! Service Registry: the indexed collection of service descriptors, by
//! `(cmd, id)` and by live child pid.

use std::collections::HashMap;

use nix::unistd::Pid;

use crate::cond::CondKey;
use crate::error::RegistryError;
use crate::service::Service;

/// Primary key identifying a service: `(cmd, id)`.
pub type ServiceKey = (String, String);

/// Indexed collection of services. Owns the canonical per-service state;
/// the pid index is kept consistent with each service's `runtime.pid`
/// field by every mutating method here.
#[derive(Default)]
pub struct Registry {
    services: HashMap<ServiceKey, Service>,
    /// Insertion order, preserved so plugin/hook iteration and
    /// `step_all` walk services in a stable, predictable sequence.
    order: Vec<ServiceKey>,
    by_pid: HashMap<Pid, ServiceKey>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    fn key_of(svc: &Service) -> ServiceKey {
        (svc.cmd.clone(), svc.id.clone())
    }

    /// Insert or replace a service under its `(cmd, id)` key. Re-registering
    /// an existing key is the reload path's job (callers decide whether to
    /// preserve runtime state); this method always takes ownership of what
    /// it's given.
    pub fn register(&mut self, svc: Service) -> ServiceKey {
        let key = Self::key_of(&svc);
        if let Some(old) = self.services.get(&key) {
            if let Some(pid) = old.runtime.pid {
                self.by_pid.remove(&pid);
            }
        } else {
            self.order.push(key.clone());
        }
        if let Some(pid) = svc.runtime.pid {
            self.by_pid.insert(pid, key.clone());
        }
        self.services.insert(key.clone(), svc);
        key
    }

    /// Remove a service entirely. Callers are responsible for having
    /// already transitioned it to `Stopping`, waited for reap, and
    /// cancelled its timer (spec section 3 lifecycle).
    pub fn unregister(&mut self, key: &ServiceKey) -> Option<Service> {
        let removed = self.services.remove(key);
        if let Some(svc) = &removed {
            if let Some(pid) = svc.runtime.pid {
                self.by_pid.remove(&pid);
            }
        }
        self.order.retain(|k| k != key);
        removed
    }

    /// Borrow a service by key.
    pub fn get(&self, key: &ServiceKey) -> Option<&Service> {
        self.services.get(key)
    }

    /// Mutably borrow a service by key.
    pub fn get_mut(&mut self, key: &ServiceKey) -> Option<&mut Service> {
        self.services.get_mut(key)
    }

    /// Borrow a service by key, or a `NotFound` error naming it.
    pub fn require(&self, key: &ServiceKey) -> Result<&Service, RegistryError> {
        self.get(key).ok_or_else(|| RegistryError::NotFound {
            cmd: key.0.clone(),
            id: key.1.clone(),
        })
    }

    /// Mutably borrow a service by key, or a `NotFound` error naming it.
    pub fn require_mut(&mut self, key: &ServiceKey) -> Result<&mut Service, RegistryError> {
        if !self.services.contains_key(key) {
            return Err(RegistryError::NotFound {
                cmd: key.0.clone(),
                id: key.1.clone(),
            });
        }
        Ok(self.services.get_mut(key).expect("checked above"))
    }

    /// Record that `key`'s service now owns live child `pid`. Enforces the
    /// invariant that a live pid belongs to at most one service.
    pub fn bind_pid(&mut self, key: &ServiceKey, pid: Pid) -> Result<(), RegistryError> {
        if let Some(existing) = self.by_pid.get(&pid) {
            if existing != key {
                return Err(RegistryError::PidCollision(pid.as_raw() as u32));
            }
        }
        self.by_pid.insert(pid, key.clone());
        if let Some(svc) = self.services.get_mut(key) {
            svc.runtime.pid = Some(pid);
        }
        Ok(())
    }

    /// Clear the pid binding for `key` (on reap).
    pub fn unbind_pid(&mut self, key: &ServiceKey) {
        if let Some(svc) = self.services.get_mut(key) {
            if let Some(pid) = svc.runtime.pid.take() {
                self.by_pid.remove(&pid);
            }
        }
    }

    /// Look up the service owning a live pid, e.g. from a `SIGCHLD` reap.
    pub fn find_by_pid(&self, pid: Pid) -> Option<&Service> {
        self.by_pid.get(&pid).and_then(|k| self.services.get(k))
    }

    /// Mutable variant of [`Registry::find_by_pid`], returning the key too
    /// so the caller can re-borrow after other mutations.
    pub fn find_key_by_pid(&self, pid: Pid) -> Option<ServiceKey> {
        self.by_pid.get(&pid).cloned()
    }

    /// Iterate all service keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &ServiceKey> {
        self.order.iter()
    }

    /// Iterate all services in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.order.iter().filter_map(move |k| self.services.get(k))
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True if no services are registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Mark every service whose dependency expression mentions `changed_key`
    /// as dirty. Returns the keys that were marked, for the caller to
    /// schedule a `step` on.
    pub fn mark_dirty_for_condition(&mut self, changed_key: &CondKey) -> Vec<ServiceKey> {
        let mut touched = Vec::new();
        for key in &self.order {
            if let Some(svc) = self.services.get_mut(key) {
                if svc.cond_expr.mentions(changed_key) && !svc.runtime.dirty {
                    svc.runtime.dirty = true;
                    touched.push(key.clone());
                }
            }
        }
        touched
    }
}
