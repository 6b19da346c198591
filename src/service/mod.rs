// src/service/mod.rs

//! Service descriptors: default run parameters per service name, and how to
//! recover advertised endpoints from a rendered argument list.

mod builtin;
mod flags;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::types::Endpoint;

pub use builtin::BuiltinService;

/// Effective launch parameters of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDefaults {
    pub executor: Vec<String>,
    pub command: String,
    pub args: Vec<String>,
    pub environment: HashMap<String, String>,
    pub endpoints: BTreeMap<String, Endpoint>,
}

/// Operator-supplied fields of a new-process request. Empty fields fall back
/// to the service defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunInfoOverride {
    pub executor: Vec<String>,
    pub command: String,
    pub args: Vec<String>,
    pub environment: HashMap<String, String>,
}

pub trait ServiceDescriptor: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn defaults(&self) -> ServiceDefaults;

    /// Endpoints a process started with `args` advertises. An argument list
    /// the service cannot parse yields the default endpoints.
    fn endpoints_from_args(&self, args: &[String]) -> BTreeMap<String, Endpoint>;

    /// Merge `overrides` over the defaults and derive endpoints from the
    /// resulting arguments.
    fn effective(&self, overrides: &RunInfoOverride) -> ServiceDefaults {
        let defaults = self.defaults();
        let pick_vec = |o: &Vec<String>, d: Vec<String>| if o.is_empty() { d } else { o.clone() };

        let args = pick_vec(&overrides.args, defaults.args);
        let endpoints = self.endpoints_from_args(&args);
        ServiceDefaults {
            executor: pick_vec(&overrides.executor, defaults.executor),
            command: if overrides.command.is_empty() {
                defaults.command
            } else {
                overrides.command.clone()
            },
            args,
            environment: if overrides.environment.is_empty() {
                defaults.environment
            } else {
                overrides.environment.clone()
            },
            endpoints,
        }
    }
}

/// Name-keyed table of known services, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    table: HashMap<String, Arc<dyn ServiceDescriptor>>,
}

impl ServiceCatalog {
    pub fn with_builtins() -> Self {
        let mut catalog = Self::default();
        for svc in BuiltinService::ALL {
            catalog.register(Arc::new(svc));
        }
        catalog
    }

    /// Add or replace a descriptor under its own name.
    pub fn register(&mut self, descriptor: Arc<dyn ServiceDescriptor>) {
        self.table.insert(descriptor.name().to_string(), descriptor);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ServiceDescriptor>> {
        self.table
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unregistered service {name}")))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
