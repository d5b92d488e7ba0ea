// rust/shardmill-core/src/layout.rs

//! Remote object layout.
//!
//! Every object the pipeline touches is addressed by a [`Role`] and a
//! [`ShardKey`]. Inputs live under configurable prefixes; outputs and logs live
//! under a directory namespaced by the [`RunId`], so distinct pipeline versions
//! never share output paths:
//!
//! ```text
//! <raw_bucket>/<raw_prefix>/<collection>/<collection>-<sub_unit>.jsonl.bz2
//! <lid_bucket>/<lid_prefix>/<collection>/<collection>-<sub_unit>.jsonl.bz2
//! <output_bucket>/<label>[-subtype]/<run-id>/<collection>/<collection>-<sub_unit>.jsonl.bz2
//! <output_bucket>/<label>[-subtype]/<run-id>/<collection>/<collection>-<sub_unit>.log
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::LayoutConfig;
use crate::error::{Result, ShardmillError};

/// A logical unit of work: one sub-unit (e.g. a year) of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub collection: String,
    pub sub_unit: String,
}

impl ShardKey {
    pub fn new(collection: impl Into<String>, sub_unit: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            sub_unit: sub_unit.into(),
        }
    }

    /// File stem shared by every object of this key, `<collection>-<sub_unit>`.
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.collection, self.sub_unit)
    }

    /// Work list line, `<collection>/<sub_unit>`.
    pub fn to_worklist_line(&self) -> String {
        format!("{}/{}", self.collection, self.sub_unit)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.collection, self.sub_unit)
    }
}

impl FromStr for ShardKey {
    type Err = ShardmillError;

    /// Parses a work list line, `<collection>/<sub_unit>`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once('/') {
            Some((collection, sub_unit))
                if !collection.is_empty() && !sub_unit.is_empty() && !sub_unit.contains('/') =>
            {
                Ok(Self::new(collection, sub_unit))
            }
            _ => Err(ShardmillError::layout(format!(
                "invalid work list entry '{s}' (expected <collection>/<sub_unit>)"
            ))),
        }
    }
}

/// Identifier of one pipeline run: process label, task, model and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    /// Builds `<label>-<task>_<model_id>_v<version>` with the version's dots
    /// written as dashes (`v1.0.0` becomes `v1-0-0`).
    pub fn new(label: &str, task: &str, model_id: &str, version: &str) -> Self {
        let version = version.trim_start_matches('v').replace('.', "-");
        Self(format!("{label}-{task}_{model_id}_v{version}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A bucket-qualified object location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemotePath {
    pub bucket: String,
    pub key: String,
}

impl RemotePath {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Returns the path of `name` below this one, treating the key as a directory.
    pub fn child(&self, name: &str) -> Self {
        Self::new(self.bucket.clone(), join_key(&self.key, name))
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// What an object is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Raw document shard.
    RawInput,
    /// Per-token language identification shard.
    LanguageId,
    /// Annotated shard published by this run.
    Output,
    /// Execution log published next to the output.
    Log,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawInput => "raw",
            Self::LanguageId => "langident",
            Self::Output => "output",
            Self::Log => "log",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps roles and shard keys to remote paths for one run.
#[derive(Debug, Clone)]
pub struct Layout {
    config: LayoutConfig,
    run_id: RunId,
}

impl Layout {
    /// Creates a layout, rejecting configurations with missing run identifiers.
    pub fn new(config: &LayoutConfig) -> Result<Self> {
        config.validate()?;
        let run_id = RunId::new(
            &config.process_label,
            &config.task,
            &config.model_id,
            &config.version,
        );
        Ok(Self {
            config: config.clone(),
            run_id,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn bucket(&self, role: Role) -> &str {
        match role {
            Role::RawInput => &self.config.raw_bucket,
            Role::LanguageId => &self.config.lid_bucket,
            Role::Output | Role::Log => &self.config.output_bucket,
        }
    }

    fn extension(&self, role: Role) -> &str {
        match role {
            Role::RawInput => &self.config.raw_extension,
            Role::LanguageId => &self.config.lid_extension,
            Role::Output => &self.config.output_extension,
            Role::Log => &self.config.log_extension,
        }
    }

    /// Key prefix below which all collections of `role` live (may be empty).
    pub fn root_key(&self, role: Role) -> String {
        match role {
            Role::RawInput => self.config.raw_prefix.trim_matches('/').to_string(),
            Role::LanguageId => self.config.lid_prefix.trim_matches('/').to_string(),
            Role::Output | Role::Log => {
                let label = if self.config.subtype.is_empty() {
                    self.config.process_label.clone()
                } else {
                    format!("{}-{}", self.config.process_label, self.config.subtype)
                };
                format!("{label}/{}", self.run_id)
            }
        }
    }

    /// Root of `role` as a remote path, used to enumerate collections.
    pub fn root(&self, role: Role) -> RemotePath {
        RemotePath::new(self.bucket(role), self.root_key(role))
    }

    /// Directory holding every object of `collection` for `role`.
    pub fn group_prefix(&self, role: Role, collection: &str) -> RemotePath {
        self.root(role).child(collection)
    }

    /// Location of the object for `key` in `role`.
    pub fn path(&self, role: Role, key: &ShardKey) -> RemotePath {
        let file_name = format!("{}.{}", key.file_stem(), self.extension(role));
        self.group_prefix(role, &key.collection).child(&file_name)
    }

    /// Recovers the shard key from an object key listed under `role`.
    ///
    /// Expects `<root>/<collection>/<collection>-<sub_unit>.<ext>`; the
    /// sub-unit is the text after the last `-` of the file stem.
    pub fn parse_key(&self, role: Role, object_key: &str) -> Result<ShardKey> {
        let root = self.root_key(role);
        let relative = if root.is_empty() {
            object_key
        } else {
            object_key
                .strip_prefix(root.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .ok_or_else(|| {
                    ShardmillError::layout(format!(
                        "object '{object_key}' is not below the {role} root '{root}'"
                    ))
                })?
        };

        let (collection, file_name) = relative.split_once('/').ok_or_else(|| {
            ShardmillError::layout(format!(
                "object '{object_key}' is not inside a collection directory"
            ))
        })?;

        let suffix = format!(".{}", self.extension(role));
        let stem = file_name.strip_suffix(suffix.as_str()).ok_or_else(|| {
            ShardmillError::layout(format!(
                "object '{object_key}' does not have the {role} extension '{suffix}'"
            ))
        })?;

        match stem.rsplit_once('-') {
            Some((prefix, sub_unit))
                if prefix == collection && !sub_unit.is_empty() && !sub_unit.contains('/') =>
            {
                Ok(ShardKey::new(collection, sub_unit))
            }
            _ => Err(ShardmillError::layout(format!(
                "object '{object_key}' is not named <collection>-<sub_unit>{suffix}"
            ))),
        }
    }
}

/// Joins two key fragments with a single `/`, tolerating an empty parent.
pub(crate) fn join_key(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}/{child}")
    }
}
