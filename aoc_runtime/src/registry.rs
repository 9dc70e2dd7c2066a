// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binding of host-side drivers to published services.
//!
//! Drivers register a pattern up front. When the service table is scanned
//! each service is matched once: an exact name wins over any wildcard, and
//! among wildcards the first registered wins. The binding lasts until the
//! table is torn down.

use crate::service::ServiceDescriptor;
use log::debug;
use std::fmt;
use std::sync::Arc;

/// A host-side consumer of one or more services.
pub trait ServiceDriver: Send + Sync {
    /// The service is online and may be used.
    fn probe(&self, service: &ServiceDescriptor);

    /// The service is gone; handles to it now fail with `DeviceGone`.
    fn remove(&self, service: &ServiceDescriptor);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pattern {
    Exact(String),
    /// `*` matches any run of characters, `?` exactly one.
    Wildcard(String),
}

impl Pattern {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Exact(exact) => exact == name,
            Pattern::Wildcard(glob) => glob_match(glob.as_bytes(), name.as_bytes()),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Exact(s) | Pattern::Wildcard(s) => f.write_str(s),
        }
    }
}

fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    let (mut p, mut n) = (0, 0);
    // Position after the last `*` and the name position it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p + 1, n));
                p += 1;
            }
            Some(&c) if c == b'?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((bp, bn)) => {
                    p = bp;
                    n = bn + 1;
                    backtrack = Some((bp, bn + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

struct Binding {
    pattern: Pattern,
    driver: Arc<dyn ServiceDriver>,
}

#[derive(Default)]
pub struct Registry {
    bindings: Vec<Binding>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn bind(&mut self, pattern: Pattern, driver: Arc<dyn ServiceDriver>) -> &mut Self {
        self.bindings.push(Binding { pattern, driver });
        self
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ServiceDriver>> {
        let exact = self
            .bindings
            .iter()
            .find(|b| matches!(&b.pattern, Pattern::Exact(e) if e == name));
        let binding = exact.or_else(|| {
            self.bindings
                .iter()
                .find(|b| matches!(b.pattern, Pattern::Wildcard(_)) && b.pattern.matches(name))
        })?;
        debug!("service {name:?} bound by pattern {:?}", binding.pattern.to_string());
        Some(binding.driver.clone())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.bindings.iter().map(|b| &b.pattern))
            .finish()
    }
}
