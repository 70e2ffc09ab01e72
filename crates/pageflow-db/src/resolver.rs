use std::collections::{BTreeMap, BTreeSet};

use pageflow_common::{Error, Result};

use crate::migrations::{Migration, Registry};

/// Order every migration in `registry` after all of its dependencies.
///
/// Among migrations that are ready at the same time the smallest id goes
/// first, so the result is identical across runs.
pub fn resolve(registry: &Registry) -> Result<Vec<&Migration>> {
    for migration in registry.iter() {
        if let Some(missing) = migration
            .dependencies()
            .iter()
            .find(|dep| !registry.contains(dep))
        {
            return Err(Error::Config(format!(
                "migration {} depends on unknown migration {missing}",
                migration.id()
            )));
        }
    }

    let mut remaining: BTreeMap<&str, usize> = registry
        .iter()
        .map(|m| (m.id(), m.dependencies().len()))
        .collect();

    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for migration in registry.iter() {
        for dep in migration.dependencies() {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(migration.id());
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut ordered = Vec::with_capacity(registry.len());
    while let Some(id) = ready.pop_first() {
        remaining.remove(id);
        if let Some(migration) = registry.get(id) {
            ordered.push(migration);
        }
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if !remaining.is_empty() {
        let blocked: BTreeSet<&str> = remaining.keys().copied().collect();
        return Err(Error::Config(format!(
            "dependency cycle: {}",
            describe_cycle(registry, &blocked)
        )));
    }

    Ok(ordered)
}

/// Walk dependencies among the blocked migrations until one repeats and
/// render that loop as `a -> b -> a`.
fn describe_cycle(registry: &Registry, blocked: &BTreeSet<&str>) -> String {
    let Some(&start) = blocked.first() else {
        return String::new();
    };

    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = registry.get(current).and_then(|m| {
            m.dependencies()
                .iter()
                .map(String::as_str)
                .find(|dep| blocked.contains(dep))
        });
        let Some(next) = next else {
            // Cannot happen for a blocked node, fall back to listing them.
            return blocked.iter().copied().collect::<Vec<_>>().join(", ");
        };
        if let Some(pos) = path.iter().position(|id| *id == next) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(next);
            return cycle.join(" -> ");
        }
        path.push(next);
        current = next;
    }
}
