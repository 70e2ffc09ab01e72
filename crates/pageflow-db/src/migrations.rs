//! Migration definitions: steps, migrations and the registry that holds them.
//!
//! Everything here is plain data. Executing it is the applier's job.

use std::collections::{BTreeMap, BTreeSet};

use pageflow_common::{Error, Result};
use ring::digest::{Context, SHA256};
use serde::{Deserialize, Serialize};

/// One reversible schema change: statements to apply it and, optionally,
/// statements to undo it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    forward: Vec<String>,
    backward: Vec<String>,
}

impl Step {
    pub fn new<F, B>(forward: F, backward: B) -> Result<Self>
    where
        F: IntoIterator,
        F::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        let forward = clean(forward);
        if forward.is_empty() {
            return Err(Error::Config(
                "a step needs at least one forward statement".into(),
            ));
        }
        Ok(Self {
            forward,
            backward: clean(backward),
        })
    }

    /// A step that cannot be rolled back.
    pub fn irreversible<F>(forward: F) -> Result<Self>
    where
        F: IntoIterator,
        F::Item: Into<String>,
    {
        Self::new(forward, Vec::<String>::new())
    }

    pub fn forward(&self) -> &[String] {
        &self.forward
    }

    pub fn backward(&self) -> &[String] {
        &self.backward
    }

    pub fn is_reversible(&self) -> bool {
        !self.backward.is_empty()
    }
}

fn clean<I>(statements: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    statements
        .into_iter()
        .map(|s| s.into().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// A named, ordered list of steps with declared prerequisites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    id: String,
    depends_on: BTreeSet<String>,
    steps: Vec<Step>,
}

impl Migration {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: BTreeSet::new(),
            steps: Vec::new(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.depends_on
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Index of the first step without rollback statements.
    pub fn first_irreversible_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.is_reversible())
    }

    /// SHA-256 over the id and every statement, hex encoded. Stored in the
    /// ledger so edits to an already applied migration are detected.
    pub fn checksum(&self) -> String {
        let mut ctx = Context::new(&SHA256);
        ctx.update(self.id.as_bytes());
        for step in &self.steps {
            ctx.update(b"\x00step");
            for stmt in &step.forward {
                ctx.update(b"\x00f");
                ctx.update(stmt.as_bytes());
            }
            for stmt in &step.backward {
                ctx.update(b"\x00b");
                ctx.update(stmt.as_bytes());
            }
        }
        ctx.finish()
            .as_ref()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("migration id cannot be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(Error::Config(format!(
                "migration {} has no steps",
                self.id
            )));
        }
        if self.depends_on.contains(&self.id) {
            return Err(Error::Config(format!(
                "migration {} depends on itself",
                self.id
            )));
        }
        Ok(())
    }
}

/// The full set of known migrations, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    migrations: BTreeMap<String, Migration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, migration: Migration) -> Result<()> {
        migration.validate()?;
        if self.migrations.contains_key(migration.id()) {
            return Err(Error::Config(format!(
                "migration {} is declared twice",
                migration.id()
            )));
        }
        self.migrations
            .insert(migration.id().to_string(), migration);
        Ok(())
    }

    pub fn with(mut self, migration: Migration) -> Result<Self> {
        self.register(migration)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&Migration> {
        self.migrations.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.migrations.contains_key(id)
    }

    /// Migrations in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
