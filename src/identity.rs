use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::read_to_string;
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;

use crate::errors::EngineError;
use crate::pipeline::{dep, CommitContext, Deps, PipelineItem};

/// Sentinel id for commits whose author matched no known identity. Chosen so
/// that no person-packed tree value can collide with the end sentinel.
pub const AUTHOR_MISSING: u32 = (1 << 18) - 2;

/// Canonical developer identities. With a dictionary the set is frozen and
/// unknown authors map to [`AUTHOR_MISSING`]; without one, identities are
/// auto-registered as commits are consumed.
#[derive(Debug)]
pub struct PeopleRegistry {
    names: Vec<String>,
    by_alias: HashMap<String, u32>,
    frozen: bool,
}

pub type PeopleHandle = Rc<RefCell<PeopleRegistry>>;

impl PeopleRegistry {
    pub fn auto() -> Self {
        Self { names: Vec::new(), by_alias: HashMap::new(), frozen: false }
    }

    /// Parse a `Display Name|email|email` dictionary; the line index is the
    /// canonical id.
    pub fn from_dict(path: &Path) -> Result<Self> {
        let text = read_to_string(path)?;
        let mut registry = Self { names: Vec::new(), by_alias: HashMap::new(), frozen: true };
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let id = registry.names.len() as u32;
            let mut fields = line.split('|');
            let display = match fields.next() {
                Some(display) if !display.is_empty() => display,
                _ => {
                    return Err(EngineError::CorruptInput(format!(
                        "identity file {}:{} has no display name",
                        path.display(),
                        lineno + 1
                    ))
                    .into());
                }
            };
            registry.names.push(display.to_string());
            registry.by_alias.insert(display.to_lowercase(), id);
            for alias in fields {
                if alias.is_empty() {
                    return Err(EngineError::CorruptInput(format!(
                        "identity file {}:{} has an empty alias",
                        path.display(),
                        lineno + 1
                    ))
                    .into());
                }
                registry.by_alias.insert(alias.to_lowercase(), id);
            }
        }
        // Ids are packed into 18 bits next to the tick, with the top slot
        // reserved for unmatched authors.
        if registry.names.len() > AUTHOR_MISSING as usize {
            return Err(EngineError::CorruptInput(format!(
                "identity file {} defines {} identities; at most {} are supported",
                path.display(),
                registry.names.len(),
                AUTHOR_MISSING
            ))
            .into());
        }
        Ok(registry)
    }

    pub fn resolve(&mut self, name: Option<&str>, email: Option<&str>) -> u32 {
        let email_key = email.map(|e| e.trim().to_lowercase()).filter(|e| !e.is_empty());
        let name_key = name.map(|n| n.trim().to_lowercase()).filter(|n| !n.is_empty());
        for key in [&email_key, &name_key].into_iter().flatten() {
            if let Some(&id) = self.by_alias.get(key) {
                return id;
            }
        }
        if self.frozen {
            return AUTHOR_MISSING;
        }
        let id = self.names.len() as u32;
        self.names.push(name.unwrap_or("<unknown>").to_string());
        for key in [email_key, name_key].into_iter().flatten() {
            self.by_alias.insert(key, id);
        }
        id
    }

    pub fn names(&self) -> Vec<String> {
        self.names.clone()
    }
}

/// Pipeline item publishing the canonical author id of every commit.
pub struct IdentityDetector {
    registry: PeopleHandle,
}

impl IdentityDetector {
    pub fn new(registry: PeopleHandle) -> Self {
        Self { registry }
    }
}

impl PipelineItem for IdentityDetector {
    fn name(&self) -> &'static str {
        "IdentityDetector"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[dep::AUTHOR]
    }

    fn consume(&mut self, ctx: &CommitContext, deps: &mut Deps) -> Result<()> {
        let author = ctx.commit.author();
        let id = self.registry.borrow_mut().resolve(author.name(), author.email());
        deps.provide(dep::AUTHOR, id);
        Ok(())
    }

    fn fork(&mut self) -> Box<dyn PipelineItem> {
        // identities are global; branches share the registry
        Box::new(Self { registry: self.registry.clone() })
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn auto_mode_registers_and_reuses() {
        let mut registry = PeopleRegistry::auto();
        let a = registry.resolve(Some("Ada"), Some("ada@example.com"));
        let b = registry.resolve(Some("Ada L."), Some("ADA@example.com"));
        let c = registry.resolve(Some("Grace"), Some("grace@example.com"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.names(), vec!["Ada".to_string(), "Grace".to_string()]);
    }

    #[test]
    fn dictionary_matches_names_and_emails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Ada Lovelace|ada@example.com|lovelace@old.org").unwrap();
        writeln!(file, "Grace Hopper|grace@example.com").unwrap();
        let mut registry = PeopleRegistry::from_dict(file.path()).unwrap();
        assert_eq!(registry.resolve(Some("someone"), Some("lovelace@old.org")), 0);
        assert_eq!(registry.resolve(Some("Grace Hopper"), Some("g@other.net")), 1);
        assert_eq!(registry.resolve(Some("stranger"), Some("x@y.z")), AUTHOR_MISSING);
        assert_eq!(registry.names().len(), 2);
    }

    #[test]
    fn malformed_dictionary_is_corrupt_input() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "|ada@example.com").unwrap();
        let err = PeopleRegistry::from_dict(file.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::CorruptInput(_))
        ));
    }
}
