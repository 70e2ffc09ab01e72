//! Loading migrations from a directory.
//!
//! Each migration is one file named after its id:
//!
//! * `<id>.sql`, a single step. `-- depends: a b` lines declare dependencies
//!   and an optional `<id>.rollback.sql` holds the backward statements.
//! * `<id>.yml`, `<id>.yaml` or `<id>.toml` with `depends_on` and a list of
//!   `steps`, each with `forward` and optional `backward` SQL.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use pageflow_common::{Error, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::migrations::{Migration, Registry, Step};

static DEPENDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*--\s*depends\s*:(.*)$").expect("static regex is valid")
});

static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)_").expect("static regex is valid"));

const ROLLBACK_SUFFIX: &str = ".rollback.sql";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MigrationFile {
    #[serde(default)]
    depends_on: Vec<String>,
    steps: Vec<StepFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepFile {
    forward: String,
    #[serde(default)]
    backward: Option<String>,
}

/// Read every migration file in `dir` into a registry.
pub fn load_dir(dir: &Path) -> Result<Registry> {
    let mut forward_files: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut rollback_files: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut structured: BTreeMap<String, PathBuf> = BTreeMap::new();

    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::Config(format!(
            "failed to read migrations directory {}: {e}",
            dir.display()
        ))
    })?;

    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        if let Some(id) = name.strip_suffix(ROLLBACK_SUFFIX) {
            rollback_files.insert(id.to_string(), path);
        } else if let Some(id) = name.strip_suffix(".sql") {
            forward_files.insert(id.to_string(), path);
        } else if let Some(id) = [".yml", ".yaml", ".toml"]
            .iter()
            .find_map(|ext| name.strip_suffix(ext))
        {
            if structured.insert(id.to_string(), path.clone()).is_some() {
                return Err(Error::Config(format!(
                    "migration {id} is declared by more than one file"
                )));
            }
        } else {
            debug!("ignoring {}", path.display());
        }
    }

    if let Some(orphan) = rollback_files
        .keys()
        .find(|id| !forward_files.contains_key(*id))
    {
        return Err(Error::Config(format!(
            "{orphan}{ROLLBACK_SUFFIX} has no matching {orphan}.sql"
        )));
    }

    let mut registry = Registry::new();
    for (id, path) in &forward_files {
        let migration = sql_migration(id, path, rollback_files.get(id).map(PathBuf::as_path))?;
        registry.register(migration).map_err(|e| in_file(path, e))?;
    }
    for (id, path) in &structured {
        let migration = structured_migration(id, path)?;
        registry.register(migration).map_err(|e| in_file(path, e))?;
    }

    info!(
        "loaded {} migrations from {}",
        registry.len(),
        dir.display()
    );
    Ok(registry)
}

fn sql_migration(id: &str, path: &Path, rollback: Option<&Path>) -> Result<Migration> {
    let forward = read(path)?;
    let backward = match rollback {
        Some(p) => split_statements(&read(p)?),
        None => Vec::new(),
    };

    let step = Step::new(split_statements(&forward), backward).map_err(|e| in_file(path, e))?;
    let migration = parse_depends(&forward)
        .into_iter()
        .fold(Migration::new(id), |m, dep| m.depends_on(dep));
    Ok(migration.step(step))
}

fn structured_migration(id: &str, path: &Path) -> Result<Migration> {
    let contents = read(path)?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let file: MigrationFile = match ext {
        "toml" => toml::from_str(&contents)
            .map_err(|e| in_file(path, Error::Config(format!("TOML parse error: {e}"))))?,
        _ => serde_yaml::from_str(&contents)
            .map_err(|e| in_file(path, Error::Config(format!("YAML parse error: {e}"))))?,
    };

    let mut migration = file
        .depends_on
        .into_iter()
        .fold(Migration::new(id), |m, dep| m.depends_on(dep));
    for step in file.steps {
        let backward = step
            .backward
            .as_deref()
            .map(split_statements)
            .unwrap_or_default();
        let step = Step::new(split_statements(&step.forward), backward)
            .map_err(|e| in_file(path, e))?;
        migration = migration.step(step);
    }
    Ok(migration)
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))
}

fn in_file(path: &Path, e: Error) -> Error {
    match e {
        Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
        other => other,
    }
}

fn parse_depends(sql: &str) -> Vec<String> {
    DEPENDS_RE
        .captures_iter(sql)
        .flat_map(|cap| {
            cap[1]
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Split SQL text into statements on `;`, ignoring semicolons inside quotes,
/// comments and trigger bodies. Comments are dropped from the output.
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\'' | '"' | '`' => {
                current.push(c);
                i += 1;
                while i < chars.len() {
                    current.push(chars[i]);
                    if chars[i] == c {
                        // A doubled quote is an escaped quote.
                        if chars.get(i + 1) == Some(&c) {
                            current.push(c);
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
                current.push(' ');
            }
            ';' if !inside_trigger_body(&current) => {
                push_statement(&mut statements, &current);
                current.clear();
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// `CREATE TRIGGER ... BEGIN ...` keeps going until the `END` matching its
/// `BEGIN`. `CASE ... END` expressions inside the body nest.
fn inside_trigger_body(current: &str) -> bool {
    let words = keywords(current);
    let is_trigger = words.first().map(String::as_str) == Some("CREATE")
        && words.iter().take(4).any(|w| w == "TRIGGER");
    if !is_trigger {
        return false;
    }

    let Some(begin) = words.iter().position(|w| w == "BEGIN") else {
        return false;
    };
    let mut depth = 1usize;
    for word in &words[begin + 1..] {
        match word.as_str() {
            "BEGIN" | "CASE" => depth += 1,
            "END" => {
                depth -= 1;
                if depth == 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// Upper-cased bare words of `sql`, skipping quoted strings and identifiers.
fn keywords(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut quote: Option<char> = None;

    for c in sql.chars() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            c if c.is_ascii_alphanumeric() || c == '_' => {
                word.push(c.to_ascii_uppercase());
                continue;
            }
            _ => {}
        }
        if !word.is_empty() {
            words.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        words.push(word);
    }
    words
}

/// Create `NNNN_<name>.sql` and its rollback file in `dir`, numbered after the
/// highest existing migration and depending on it. Returns the new id.
pub fn scaffold(dir: &Path, name: &str) -> Result<String> {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string();
    if slug.is_empty() {
        return Err(Error::Config(format!("invalid migration name `{name}`")));
    }

    std::fs::create_dir_all(dir)?;

    let mut latest: Option<(u64, String)> = None;
    for entry in std::fs::read_dir(dir)? {
        let file_name = entry?.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let id = [ROLLBACK_SUFFIX, ".sql", ".yml", ".yaml", ".toml"]
            .iter()
            .find_map(|ext| file_name.strip_suffix(ext));
        let Some(id) = id else { continue };
        if let Some(number) = NUMBERED_RE
            .captures(id)
            .and_then(|cap| cap[1].parse::<u64>().ok())
        {
            if latest.as_ref().is_none_or(|(n, _)| number > *n) {
                latest = Some((number, id.to_string()));
            }
        }
    }

    let number = latest.as_ref().map(|(n, _)| n + 1).unwrap_or(1);
    let id = format!("{number:04}_{slug}");
    let forward_path = dir.join(format!("{id}.sql"));
    if forward_path.exists() {
        return Err(Error::Config(format!("{} already exists", forward_path.display())));
    }

    let mut forward = format!("-- {name}\n");
    if let Some((_, dep)) = &latest {
        forward.push_str(&format!("-- depends: {dep}\n"));
    }
    forward.push_str("\n-- Replace the placeholder with the schema change.\nSELECT 1;\n");

    std::fs::write(&forward_path, forward)?;
    std::fs::write(
        dir.join(format!("{id}{ROLLBACK_SUFFIX}")),
        format!(
            "-- rollback for {id}\n\n-- Replace the placeholder with the undo statements.\nSELECT 1;\n"
        ),
    )?;

    info!("created migration {id} in {}", dir.display());
    Ok(id)
}
