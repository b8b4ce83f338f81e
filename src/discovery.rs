//! Logical service name → address resolution.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Resolves a logical service name to the base addresses currently serving it.
pub trait Resolver: Send + Sync + std::fmt::Debug {
    /// Every known address; empty when the name is unknown.
    fn resolve(&self, service: &str) -> Vec<String>;

    /// One address to send the next request to.
    fn pick(&self, service: &str) -> Option<String> {
        self.resolve(service).into_iter().next()
    }
}

/// Fixed table of addresses, typically loaded from configuration. `pick` rotates through a
/// service's addresses.
#[derive(Debug, Default)]
pub struct StaticResolver {
    services: BTreeMap<String, Vec<String>>,
    cursor: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addresses` under `service`, replacing any previous entry. Trailing slashes are
    /// trimmed so paths can be appended directly.
    pub fn with_service<I, A>(mut self, service: impl Into<String>, addresses: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        let addresses = addresses
            .into_iter()
            .map(|a| a.into().trim_end_matches('/').to_owned())
            .collect();
        self.services.insert(service.into(), addresses);
        self
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.get(service).is_some_and(|a| !a.is_empty())
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, service: &str) -> Vec<String> {
        self.services.get(service).cloned().unwrap_or_default()
    }

    fn pick(&self, service: &str) -> Option<String> {
        let addresses = self.services.get(service)?;
        if addresses.is_empty() {
            return None;
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        addresses.get(n % addresses.len()).cloned()
    }
}
