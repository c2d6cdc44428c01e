//! core::config::interpolate
//!
//! Placeholder substitution and built-in interpolations.
//!
//! # Placeholders
//!
//! A [`Substitutions`] map replaces fixed tokens (for example
//! [`BUCKET_PLACEHOLDER`]) in every string value of a configuration. Tokens
//! with no registered value are left as they are. A value may not contain any
//! registered token, so applying the same substitutions twice is a no-op.
//!
//! # Built-ins
//!
//! Two expressions are understood inside string values:
//!
//! - `${find_in_parent_folders()}` - path of the nearest `stackguard.toml`
//!   above the file being read
//! - `${path_relative_to_include()}` - path of the module directory relative
//!   to the directory of the file it includes (`.` without an include)
//!
//! Any other `${...}` text is left untouched.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use super::{ConfigError, CONFIG_FILE_NAME};

/// Token the test fixtures and templates use for a generated bucket name.
pub const BUCKET_PLACEHOLDER: &str = "__FILL_IN_BUCKET_NAME__";

const FIND_IN_PARENT_FOLDERS: &str = "${find_in_parent_folders()}";
const PATH_RELATIVE_TO_INCLUDE: &str = "${path_relative_to_include()}";

/// Caller-supplied placeholder values.
///
/// # Example
///
/// ```
/// use stackguard::core::config::Substitutions;
///
/// let mut subs = Substitutions::new();
/// subs.insert("__FILL_IN_BUCKET_NAME__", "my-bucket").unwrap();
///
/// let once = subs.apply("bucket = __FILL_IN_BUCKET_NAME__, other = __KEEP__");
/// assert_eq!(once, "bucket = my-bucket, other = __KEEP__");
/// assert_eq!(subs.apply(&once), once);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    values: BTreeMap<String, String>,
}

impl Substitutions {
    /// Create an empty substitution map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Substitutions that only fill in the bucket placeholder.
    pub fn for_bucket(bucket: &str) -> Result<Self, ConfigError> {
        let mut subs = Self::new();
        subs.insert(BUCKET_PLACEHOLDER, bucket)?;
        Ok(subs)
    }

    /// Register a token and its value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the token is empty, or if any
    /// value would contain any token.
    pub fn insert(
        &mut self,
        token: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ConfigError> {
        let token = token.into();
        let value = value.into();

        if token.is_empty() {
            return Err(ConfigError::InvalidValue(
                "substitution token cannot be empty".into(),
            ));
        }
        if value.contains(&token) || self.values.keys().any(|t| value.contains(t.as_str())) {
            return Err(ConfigError::InvalidValue(format!(
                "substitution value for '{}' cannot contain a placeholder token",
                token
            )));
        }
        if self.values.values().any(|v| v.contains(&token)) {
            return Err(ConfigError::InvalidValue(format!(
                "token '{}' appears inside another substitution value",
                token
            )));
        }

        self.values.insert(token, value);
        Ok(())
    }

    /// Parse a `TOKEN=VALUE` pair (as given on the command line).
    pub fn parse_pair(pair: &str) -> Result<(String, String), ConfigError> {
        match pair.split_once('=') {
            Some((token, value)) if !token.is_empty() => Ok((token.to_string(), value.to_string())),
            _ => Err(ConfigError::InvalidValue(format!(
                "expected TOKEN=VALUE, got '{}'",
                pair
            ))),
        }
    }

    /// Build substitutions from `TOKEN=VALUE` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut subs = Self::new();
        for pair in pairs {
            let (token, value) = Self::parse_pair(pair.as_ref())?;
            subs.insert(token, value)?;
        }
        Ok(subs)
    }

    /// Whether no tokens are registered.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value registered for `token`.
    pub fn get(&self, token: &str) -> Option<&str> {
        self.values.get(token).map(String::as_str)
    }

    /// Replace every registered token in `template` in one left-to-right
    /// pass. When tokens overlap at a position, the longest wins.
    pub fn apply(&self, template: &str) -> String {
        if self.values.is_empty() {
            return template.to_string();
        }

        let mut tokens: Vec<(&str, &str)> = self
            .values
            .iter()
            .map(|(t, v)| (t.as_str(), v.as_str()))
            .collect();
        tokens.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        'outer: while !rest.is_empty() {
            for (token, value) in &tokens {
                if let Some(after) = rest.strip_prefix(token) {
                    out.push_str(value);
                    rest = after;
                    continue 'outer;
                }
            }
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
        out
    }
}

/// Where a configuration file sits in its include chain, for evaluating
/// built-ins.
#[derive(Debug, Clone)]
pub struct InterpolationContext<'a> {
    /// The file whose strings are being evaluated.
    pub file: &'a Path,
    /// Value of `${path_relative_to_include()}`, once the chain is known.
    pub relative_to_include: Option<&'a str>,
}

/// Evaluate placeholders and built-ins in one string value.
pub fn interpolate(
    value: &str,
    subs: &Substitutions,
    ctx: &InterpolationContext<'_>,
) -> Result<String, ConfigError> {
    let mut out = subs.apply(value);

    if out.contains(FIND_IN_PARENT_FOLDERS) {
        let found = find_in_parent_folders(ctx.file)?;
        out = out.replace(FIND_IN_PARENT_FOLDERS, &found.to_string_lossy());
    }

    if out.contains(PATH_RELATIVE_TO_INCLUDE) {
        if let Some(rel) = ctx.relative_to_include {
            out = out.replace(PATH_RELATIVE_TO_INCLUDE, rel);
        }
    }

    Ok(out)
}

/// Evaluate placeholders and built-ins in every string of a TOML tree.
pub fn interpolate_tree(
    value: &mut toml::Value,
    subs: &Substitutions,
    ctx: &InterpolationContext<'_>,
) -> Result<(), ConfigError> {
    match value {
        toml::Value::String(s) => {
            *s = interpolate(s, subs, ctx)?;
        }
        toml::Value::Array(items) => {
            for item in items {
                interpolate_tree(item, subs, ctx)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                interpolate_tree(item, subs, ctx)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Find the nearest configuration file in a directory above `file`'s own.
pub fn find_in_parent_folders(file: &Path) -> Result<PathBuf, ConfigError> {
    let start = file.parent().and_then(Path::parent);
    let mut dir = start;
    while let Some(current) = dir {
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        dir = current.parent();
    }
    Err(ConfigError::ParentNotFound {
        path: file.to_path_buf(),
    })
}

/// Relative path from directory `from` to directory `to`.
///
/// Both paths should be absolute and normalized. Returns `.` when they are
/// the same directory.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component<'_>> = from.components().collect();
    let to: Vec<Component<'_>> = to.components().collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for component in &to[common..] {
        rel.push(component.as_os_str());
    }

    if rel.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        rel
    }
}
