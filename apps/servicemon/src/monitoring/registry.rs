use std::collections::BTreeMap;
use std::sync::Arc;

use super::checker::{CheckDefaults, Checker, CheckerKind, HttpChecker, PortChecker, SshChecker};
use crate::database::models::CheckerSpec;
use crate::error::CheckerError;

/// Builds a checker for one service
pub type CheckerFactory =
    Arc<dyn Fn(&CheckerSpec, &CheckDefaults) -> Result<Box<dyn Checker>, CheckerError> + Send + Sync>;

struct Entry {
    kind: CheckerKind,
    factory: CheckerFactory,
}

/// Maps checker type names to their description and factory.
///
/// Type names are matched case-insensitively.
#[derive(Default)]
pub struct CheckerRegistry {
    entries: BTreeMap<String, Entry>,
}

impl CheckerRegistry {
    /// Registry with every checker shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(HttpChecker::HTTP, |spec, defaults| {
            Ok(Box::new(HttpChecker::new(spec, defaults, false)?))
        });
        registry.register(HttpChecker::HTTPS, |spec, defaults| {
            Ok(Box::new(HttpChecker::new(spec, defaults, true)?))
        });
        registry.register(PortChecker::KIND, |spec, defaults| Ok(Box::new(PortChecker::new(spec, defaults)?)));
        registry.register(SshChecker::KIND, |spec, defaults| Ok(Box::new(SshChecker::new(spec, defaults)?)));
        registry
    }

    /// Add or replace a checker type
    pub fn register<F>(&mut self, kind: CheckerKind, factory: F)
    where
        F: Fn(&CheckerSpec, &CheckDefaults) -> Result<Box<dyn Checker>, CheckerError> + Send + Sync + 'static,
    {
        self.entries.insert(kind.type_name.to_ascii_lowercase(), Entry { kind, factory: Arc::new(factory) });
    }

    pub fn kind(&self, type_name: &str) -> Option<&CheckerKind> {
        self.entries.get(&type_name.to_ascii_lowercase()).map(|entry| &entry.kind)
    }

    /// All registered kinds, sorted by name
    pub fn kinds(&self) -> impl Iterator<Item = &CheckerKind> {
        self.entries.values().map(|entry| &entry.kind)
    }

    /// Construct the checker for `spec`.
    ///
    /// Fails when the handler is unknown, a required argument is missing or
    /// the target is IPv6 and the checker cannot handle it; argument
    /// validation is left to the factory.
    pub fn build(&self, spec: &CheckerSpec, defaults: &CheckDefaults) -> Result<Box<dyn Checker>, CheckerError> {
        let entry = self
            .entries
            .get(&spec.handler.to_ascii_lowercase())
            .ok_or_else(|| CheckerError::UnknownHandler(spec.handler.clone()))?;

        if spec.ip.is_ipv6() && !entry.kind.ipv6_support {
            return Err(CheckerError::Ipv6Unsupported { handler: entry.kind.type_name.to_string() });
        }
        if let Some(missing) = entry.kind.required_args.iter().find(|name| spec.arg(name).is_none()) {
            return Err(CheckerError::MissingArgument(*missing));
        }

        (entry.factory)(spec, defaults)
    }
}

impl std::fmt::Display for CheckerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for kind in self.kinds() {
            writeln!(f, "{:<8} {}", kind.type_name, kind.description)?;
            if !kind.required_args.is_empty() {
                writeln!(f, "         required: {}", kind.required_args.join(", "))?;
            }
            if !kind.optional_args.is_empty() {
                let optional: Vec<String> = kind
                    .optional_args
                    .iter()
                    .map(|(name, default)| {
                        if default.is_empty() { name.to_string() } else { format!("{name}={default}") }
                    })
                    .collect();
                writeln!(f, "         optional: {}", optional.join(", "))?;
            }
            if !kind.ipv6_support {
                writeln!(f, "         IPv4 only")?;
            }
        }
        Ok(())
    }
}
