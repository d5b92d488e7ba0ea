// rust/shardmill-core/src/config.rs

//! Configuration management for shardmill.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values. The validated
//! [`PipelineConfig`] is the only configuration surface: every component
//! receives its own section at construction time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, ShardmillError};

// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub layout: LayoutConfig,
    pub stamps: StampConfig,
    pub scheduler: SchedulerConfig,
    pub annotator: AnnotatorConfig,
}

/// Remote store backend type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendType {
    /// A directory tree standing in for the object store (shared filesystems, tests).
    #[default]
    Local,
    /// S3-compatible object storage.
    S3,
}

// Remote store configuration options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store backend type: "local" or "s3".
    pub backend: StoreBackendType,
    // Root directory of the local backend; buckets are its first-level directories.
    pub local_root: PathBuf,
    /// S3-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

/// S3-compatible storage configuration.
///
/// Bucket names are not part of this section: they come from [`LayoutConfig`]
/// since inputs and outputs usually live in different buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// AWS region (e.g., "us-east-1").
    pub region: String,
    /// Custom endpoint URL (for MinIO, Switch, Ceph, etc.).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Access key ID (if not using instance credentials).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    /// Secret access key (if not using instance credentials).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    /// Session token (for temporary credentials).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Maximum number of retries for failed requests.
    pub max_retries: u32,
    /// Initial delay (milliseconds) between retries.
    pub retry_delay_ms: u64,
    /// Maximum delay (milliseconds) between retries.
    pub max_retry_delay_ms: u64,
    /// Whether to use path-style addressing (required for MinIO).
    pub force_path_style: bool,
    /// Whether to allow HTTP (non-TLS) connections.
    pub allow_http: bool,
    /// Publish outputs with an `If-None-Match: *` conditional create.
    ///
    /// Disable only for stores that reject conditional writes; publishing then
    /// falls back to an existence check followed by a plain PUT.
    pub conditional_put: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            max_retries: 5,
            retry_delay_ms: 100,
            max_retry_delay_ms: 30_000,
            force_path_style: false,
            allow_http: false,
            conditional_put: true,
        }
    }
}

impl S3Config {
    /// Apply environment variable overrides to S3 configuration.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SHARDMILL_S3_REGION") {
            self.region = val;
        }
        if let Ok(val) = std::env::var("SHARDMILL_S3_ENDPOINT") {
            self.endpoint = Some(val);
        }
        if let Ok(val) = std::env::var("SHARDMILL_S3_ACCESS_KEY_ID") {
            self.access_key_id = Some(val);
        }
        if let Ok(val) = std::env::var("SHARDMILL_S3_SECRET_ACCESS_KEY") {
            self.secret_access_key = Some(val);
        }
        if let Ok(val) = std::env::var("SHARDMILL_S3_SESSION_TOKEN") {
            self.session_token = Some(val);
        }
        if let Some(v) = env_parse("SHARDMILL_S3_MAX_RETRIES") {
            self.max_retries = v;
        }
        if let Some(v) = env_parse("SHARDMILL_S3_RETRY_DELAY_MS") {
            self.retry_delay_ms = v;
        }
        if let Some(v) = env_parse("SHARDMILL_S3_MAX_RETRY_DELAY_MS") {
            self.max_retry_delay_ms = v;
        }
        if let Some(v) = env_parse("SHARDMILL_S3_FORCE_PATH_STYLE") {
            self.force_path_style = v;
        }
        if let Some(v) = env_parse("SHARDMILL_S3_ALLOW_HTTP") {
            self.allow_http = v;
        }
        if let Some(v) = env_parse("SHARDMILL_S3_CONDITIONAL_PUT") {
            self.conditional_put = v;
        }
        self
    }

    /// Validate S3 configuration.
    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(ShardmillError::config("store.s3.region must not be empty"));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(ShardmillError::config(
                "store.s3.max_retry_delay_ms must not be smaller than store.s3.retry_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Where inputs live, where outputs go, and which run they belong to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Bucket holding the raw document shards.
    pub raw_bucket: String,
    /// Key prefix of the raw shards inside `raw_bucket` (may be empty).
    pub raw_prefix: String,
    /// Bucket holding the language-identification shards.
    pub lid_bucket: String,
    /// Key prefix of the language-identification run inside `lid_bucket`.
    pub lid_prefix: String,
    /// Bucket receiving annotated shards and their logs.
    pub output_bucket: String,
    /// Process label, e.g. "lingproc".
    pub process_label: String,
    /// Optional subtype appended to the label directory, e.g. "pos".
    pub subtype: String,
    /// Task name encoded in the run identifier.
    pub task: String,
    /// Model identifier encoded in the run identifier.
    pub model_id: String,
    /// Semantic version of the run, e.g. "v1.0.0".
    pub version: String,
    pub raw_extension: String,
    pub lid_extension: String,
    pub output_extension: String,
    pub log_extension: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            raw_bucket: String::new(),
            raw_prefix: String::new(),
            lid_bucket: String::new(),
            lid_prefix: String::new(),
            output_bucket: String::new(),
            process_label: "lingproc".to_string(),
            subtype: String::new(),
            task: String::new(),
            model_id: String::new(),
            version: String::new(),
            raw_extension: "jsonl.bz2".to_string(),
            lid_extension: "jsonl.bz2".to_string(),
            output_extension: "jsonl.bz2".to_string(),
            log_extension: "log".to_string(),
        }
    }
}

impl LayoutConfig {
    /// Validate layout configuration.
    ///
    /// Every run identifier component is required: two runs that differ only
    /// in an omitted component would otherwise share output paths.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("layout.raw_bucket", &self.raw_bucket),
            ("layout.lid_bucket", &self.lid_bucket),
            ("layout.output_bucket", &self.output_bucket),
            ("layout.process_label", &self.process_label),
            ("layout.task", &self.task),
            ("layout.model_id", &self.model_id),
            ("layout.version", &self.version),
            ("layout.raw_extension", &self.raw_extension),
            ("layout.lid_extension", &self.lid_extension),
            ("layout.output_extension", &self.output_extension),
            ("layout.log_extension", &self.log_extension),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ShardmillError::config(format!("{name} must not be empty")));
            }
        }

        for (name, value) in [
            ("layout.process_label", &self.process_label),
            ("layout.subtype", &self.subtype),
            ("layout.task", &self.task),
            ("layout.model_id", &self.model_id),
            ("layout.version", &self.version),
        ] {
            if value.contains('/') {
                return Err(ShardmillError::config(format!(
                    "{name} must not contain '/'"
                )));
            }
        }
        Ok(())
    }
}

// Local stamp mirror options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StampConfig {
    // Root of the local mirror; path-isomorphic to the remote layout.
    pub build_dir: PathBuf,
    // Materialized work list; relative paths resolve against `build_dir`.
    pub worklist_file: PathBuf,
}

impl Default for StampConfig {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("./build.d"),
            worklist_file: PathBuf::from("worklist.txt"),
        }
    }
}

impl StampConfig {
    /// Returns the work list path, resolved against the build directory.
    pub fn worklist_path(&self) -> PathBuf {
        if self.worklist_file.is_absolute() {
            self.worklist_file.clone()
        } else {
            self.build_dir.join(&self.worklist_file)
        }
    }
}

/// Order in which work units are visited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingPolicy {
    /// Shuffle, so that independent machines rarely pick the same unit next.
    #[default]
    Random,
    /// Newest sub-units first.
    Recency,
}

impl FromStr for OrderingPolicy {
    type Err = ShardmillError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "random" | "shuffle" => Ok(Self::Random),
            "recency" | "recent" => Ok(Self::Recency),
            other => Err(ShardmillError::config(format!(
                "unknown ordering policy '{other}' (expected 'random' or 'recency')"
            ))),
        }
    }
}

// Scheduling options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    // Width of the worker pool.
    pub workers: usize,
    pub ordering: OrderingPolicy,
    // Seed for reproducible shuffling.
    pub seed: Option<u64>,
    // Restrict work to these collections (empty means all).
    pub collections: Vec<String>,
    // Maximum number of items dispatched per pass.
    pub limit: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            ordering: OrderingPolicy::Random,
            seed: None,
            collections: Vec::new(),
            limit: None,
        }
    }
}

/// Compression applied to the annotated shard before it is published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCompression {
    /// Publish the annotator's bytes as they are.
    None,
    /// bzip2, for annotators that write plain JSONL.
    #[default]
    #[serde(rename = "bz2")]
    Bzip2,
}

impl FromStr for OutputCompression {
    type Err = ShardmillError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "bz2" | "bzip2" => Ok(Self::Bzip2),
            other => Err(ShardmillError::config(format!(
                "unknown output compression '{other}' (expected 'none' or 'bz2')"
            ))),
        }
    }
}

/// External annotation program and its exit-status contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotatorConfig {
    /// Program to execute once per work item.
    pub program: String,
    /// Arguments; `{input}`, `{lid}`, `{output}`, `{log}` and `{key}` are substituted.
    pub args: Vec<String>,
    /// Exit code meaning "remote output already present, nothing to do".
    pub skip_exit_code: i32,
    /// Exit code meaning "output produced but failed validation".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_exit_code: Option<i32>,
    /// Compression of the annotator output before publishing.
    pub compression: OutputCompression,
    /// bzip2 block size level (1-9).
    pub compression_level: u32,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: vec![
                "{input}".to_string(),
                "--lid".to_string(),
                "{lid}".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
            ],
            skip_exit_code: 3,
            validation_exit_code: None,
            compression: OutputCompression::Bzip2,
            compression_level: 9,
        }
    }
}

impl AnnotatorConfig {
    /// Validate the exit-status contract.
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(ShardmillError::config("annotator.program must not be empty"));
        }
        if self.skip_exit_code == 0 {
            return Err(ShardmillError::config(
                "annotator.skip_exit_code must be non-zero",
            ));
        }
        if let Some(code) = self.validation_exit_code {
            if code == 0 || code == self.skip_exit_code {
                return Err(ShardmillError::config(
                    "annotator.validation_exit_code must be non-zero and differ from skip_exit_code",
                ));
            }
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(ShardmillError::config(
                "annotator.compression_level must be between 1 and 9",
            ));
        }
        Ok(())
    }
}

impl FromStr for PipelineConfig {
    type Err = ShardmillError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ShardmillError::config_with_source("failed to parse TOML config", e))
    }
}

impl PipelineConfig {
    // Load configuration from a TOML file.
    //
    // Validation is left to the caller so that environment overrides can be
    // applied first.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShardmillError::config_with_source(
                format!("failed to read config file '{}'", path.display()),
                e,
            )
        })?;
        content.parse()
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `SHARDMILL_` and use underscores
    // to separate nested fields. For example:
    // - `SHARDMILL_STORE_BACKEND` overrides `store.backend` ("local" or "s3")
    // - `SHARDMILL_LAYOUT_VERSION` overrides `layout.version`
    // - `SHARDMILL_SCHEDULER_WORKERS` overrides `scheduler.workers`
    // - `SHARDMILL_S3_ENDPOINT` overrides `store.s3.endpoint`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Store overrides
        if let Ok(val) = std::env::var("SHARDMILL_STORE_BACKEND") {
            match val.to_lowercase().as_str() {
                "local" => self.store.backend = StoreBackendType::Local,
                "s3" => self.store.backend = StoreBackendType::S3,
                _ => {} // ignore invalid values
            }
        }
        if let Ok(val) = std::env::var("SHARDMILL_STORE_LOCAL_ROOT") {
            self.store.local_root = PathBuf::from(val);
        }

        // S3 overrides - create S3Config if the S3 backend is selected
        if self.store.backend == StoreBackendType::S3 || self.store.s3.is_some() {
            let s3_config = self.store.s3.take().unwrap_or_default().with_env_overrides();
            self.store.s3 = Some(s3_config);
        }

        // Layout overrides
        let layout = &mut self.layout;
        for (var, field) in [
            ("SHARDMILL_LAYOUT_RAW_BUCKET", &mut layout.raw_bucket),
            ("SHARDMILL_LAYOUT_RAW_PREFIX", &mut layout.raw_prefix),
            ("SHARDMILL_LAYOUT_LID_BUCKET", &mut layout.lid_bucket),
            ("SHARDMILL_LAYOUT_LID_PREFIX", &mut layout.lid_prefix),
            ("SHARDMILL_LAYOUT_OUTPUT_BUCKET", &mut layout.output_bucket),
            ("SHARDMILL_LAYOUT_PROCESS_LABEL", &mut layout.process_label),
            ("SHARDMILL_LAYOUT_SUBTYPE", &mut layout.subtype),
            ("SHARDMILL_LAYOUT_TASK", &mut layout.task),
            ("SHARDMILL_LAYOUT_MODEL_ID", &mut layout.model_id),
            ("SHARDMILL_LAYOUT_VERSION", &mut layout.version),
        ] {
            if let Ok(val) = std::env::var(var) {
                *field = val;
            }
        }

        // Stamp overrides
        if let Ok(val) = std::env::var("SHARDMILL_STAMPS_BUILD_DIR") {
            self.stamps.build_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SHARDMILL_STAMPS_WORKLIST_FILE") {
            self.stamps.worklist_file = PathBuf::from(val);
        }

        // Scheduler overrides
        if let Some(v) = env_parse("SHARDMILL_SCHEDULER_WORKERS") {
            self.scheduler.workers = v;
        }
        if let Some(v) = env_parse("SHARDMILL_SCHEDULER_ORDERING") {
            self.scheduler.ordering = v;
        }
        if let Some(v) = env_parse("SHARDMILL_SCHEDULER_SEED") {
            self.scheduler.seed = Some(v);
        }
        if let Some(v) = env_parse("SHARDMILL_SCHEDULER_LIMIT") {
            self.scheduler.limit = Some(v);
        }

        // Annotator overrides
        if let Ok(val) = std::env::var("SHARDMILL_ANNOTATOR_PROGRAM") {
            self.annotator.program = val;
        }
        if let Some(v) = env_parse("SHARDMILL_ANNOTATOR_SKIP_EXIT_CODE") {
            self.annotator.skip_exit_code = v;
        }
        if let Some(v) = env_parse("SHARDMILL_ANNOTATOR_COMPRESSION") {
            self.annotator.compression = v;
        }

        self
    }

    // Validate all configuration values.
    //
    // Returns a configuration error, before any work is attempted, if a run
    // identifier component, a bucket, or a required store section is missing.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackendType::S3 {
            match &self.store.s3 {
                Some(s3_config) => s3_config.validate()?,
                None => {
                    return Err(ShardmillError::config(
                        "store.s3 configuration is required when backend is 's3'",
                    ));
                }
            }
        }
        if self.store.backend == StoreBackendType::Local
            && self.store.local_root.as_os_str().is_empty()
        {
            return Err(ShardmillError::config(
                "store.local_root must be set when backend is 'local'",
            ));
        }

        self.layout.validate()?;

        if self.stamps.build_dir.as_os_str().is_empty() {
            return Err(ShardmillError::config("stamps.build_dir must not be empty"));
        }

        if self.scheduler.workers == 0 {
            return Err(ShardmillError::config(
                "scheduler.workers must be greater than 0",
            ));
        }
        if self.scheduler.limit == Some(0) {
            return Err(ShardmillError::config(
                "scheduler.limit must be greater than 0 when set",
            ));
        }

        self.annotator.validate()
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|val| val.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.store.local_root = PathBuf::from("/tmp/store");
        config.layout.raw_bucket = "rebuilt".to_string();
        config.layout.lid_bucket = "langident".to_string();
        config.layout.output_bucket = "processed".to_string();
        config.layout.task = "pos".to_string();
        config.layout.model_id = "spacy_v3.6.0-multilingual".to_string();
        config.layout.version = "v1.0.0".to_string();
        config.annotator.program = "annotate".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();

        assert_eq!(config.store.backend, StoreBackendType::Local);
        assert!(config.store.s3.is_none());
        assert_eq!(config.layout.process_label, "lingproc");
        assert_eq!(config.layout.raw_extension, "jsonl.bz2");
        assert_eq!(config.stamps.build_dir, PathBuf::from("./build.d"));
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.scheduler.ordering, OrderingPolicy::Random);
        assert_eq!(config.annotator.skip_exit_code, 3);
        assert_eq!(config.annotator.compression, OutputCompression::Bzip2);
        assert_eq!(config.annotator.compression_level, 9);
    }

    #[test]
    fn test_default_does_not_validate() {
        // Run identifiers have no sensible defaults.
        let result = PipelineConfig::default().validate();
        assert!(result.is_err());
    }

    #[test]
    fn test_valid_config_validates() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [store]
            backend = "s3"

            [store.s3]
            region = "eu-central-1"
            endpoint = "https://os.example.org/"
            max_retries = 3
            force_path_style = true

            [layout]
            raw_bucket = "rebuilt"
            raw_prefix = "final"
            lid_bucket = "langident"
            lid_prefix = "langident/lid_v2-0-2"
            output_bucket = "processed"
            process_label = "lingproc"
            subtype = "pos"
            task = "pos"
            model_id = "spacy_v3.6.0-multilingual"
            version = "v1.0.0"

            [stamps]
            build_dir = "/scratch/build.d"

            [scheduler]
            workers = 8
            ordering = "recency"
            seed = 42
            collections = ["actionfem", "waeschfra"]
            limit = 10

            [annotator]
            program = "python3"
            args = ["lib/spacy_linguistic_processing.py", "{input}", "--lid", "{lid}", "-o", "{output}"]
            skip_exit_code = 3
            validation_exit_code = 4
            compression = "none"
        "#;

        let config: PipelineConfig = toml.parse().unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.store.backend, StoreBackendType::S3);
        let s3 = config.store.s3.as_ref().unwrap();
        assert_eq!(s3.region, "eu-central-1");
        assert_eq!(s3.endpoint.as_deref(), Some("https://os.example.org/"));
        assert_eq!(s3.max_retries, 3);
        assert!(s3.force_path_style);
        assert!(s3.conditional_put);

        assert_eq!(config.layout.raw_prefix, "final");
        assert_eq!(config.layout.subtype, "pos");
        assert_eq!(config.stamps.build_dir, PathBuf::from("/scratch/build.d"));
        assert_eq!(config.scheduler.workers, 8);
        assert_eq!(config.scheduler.ordering, OrderingPolicy::Recency);
        assert_eq!(config.scheduler.seed, Some(42));
        assert_eq!(config.scheduler.collections, vec!["actionfem", "waeschfra"]);
        assert_eq!(config.scheduler.limit, Some(10));
        assert_eq!(config.annotator.program, "python3");
        assert_eq!(config.annotator.validation_exit_code, Some(4));
        assert_eq!(config.annotator.compression, OutputCompression::None);
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<PipelineConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [stamps]
            build_dir = "/tmp/stamps"
            "#
        )
        .unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.stamps.build_dir, PathBuf::from("/tmp/stamps"));
    }

    #[test]
    fn test_from_file_not_found() {
        let result = PipelineConfig::from_file("/nonexistent/shardmill.toml");
        assert!(matches!(result, Err(ShardmillError::Config { .. })));
    }

    #[test]
    fn test_validate_missing_version() {
        let mut config = valid_config();
        config.layout.version = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("layout.version"));
    }

    #[test]
    fn test_validate_missing_output_bucket() {
        let mut config = valid_config();
        config.layout.output_bucket = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("layout.output_bucket"));
    }

    #[test]
    fn test_validate_slash_in_run_identifier() {
        let mut config = valid_config();
        config.layout.model_id = "spacy/fr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = valid_config();
        config.scheduler.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_missing_annotator_program() {
        let mut config = valid_config();
        config.annotator.program = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("annotator.program"));
    }

    #[test]
    fn test_validate_zero_skip_exit_code() {
        let mut config = valid_config();
        config.annotator.skip_exit_code = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_validation_code_collides_with_skip() {
        let mut config = valid_config();
        config.annotator.validation_exit_code = Some(3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_compression_level() {
        let mut config = valid_config();
        config.annotator.compression_level = 0;
        assert!(config.validate().is_err());
        config.annotator.compression_level = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_output_compression_from_str() {
        assert_eq!("bz2".parse::<OutputCompression>().unwrap(), OutputCompression::Bzip2);
        assert_eq!("BZIP2".parse::<OutputCompression>().unwrap(), OutputCompression::Bzip2);
        assert_eq!("none".parse::<OutputCompression>().unwrap(), OutputCompression::None);
        assert!("gzip".parse::<OutputCompression>().is_err());
    }

    #[test]
    fn test_s3_backend_requires_s3_config() {
        let mut config = valid_config();
        config.store.backend = StoreBackendType::S3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("store.s3 configuration is required"));
    }

    #[test]
    fn test_worklist_path_resolution() {
        let mut stamps = StampConfig::default();
        stamps.build_dir = PathBuf::from("/b");
        assert_eq!(stamps.worklist_path(), PathBuf::from("/b/worklist.txt"));

        stamps.worklist_file = PathBuf::from("/elsewhere/list.txt");
        assert_eq!(stamps.worklist_path(), PathBuf::from("/elsewhere/list.txt"));
    }

    #[test]
    fn test_ordering_policy_from_str() {
        assert_eq!("random".parse::<OrderingPolicy>().unwrap(), OrderingPolicy::Random);
        assert_eq!("Recency".parse::<OrderingPolicy>().unwrap(), OrderingPolicy::Recency);
        assert!("alphabetical".parse::<OrderingPolicy>().is_err());
    }

    // Helper to clear all SHARDMILL_ environment variables for test isolation
    fn clear_shardmill_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("SHARDMILL_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test to avoid
    // races, since env vars are global state.
    #[test]
    fn test_env_overrides() {
        clear_shardmill_env_vars();

        std::env::set_var("SHARDMILL_STORE_BACKEND", "s3");
        std::env::set_var("SHARDMILL_S3_ENDPOINT", "http://localhost:9000");
        std::env::set_var("SHARDMILL_LAYOUT_VERSION", "v2.0.0");
        std::env::set_var("SHARDMILL_SCHEDULER_WORKERS", "16");
        std::env::set_var("SHARDMILL_SCHEDULER_ORDERING", "recency");
        std::env::set_var("SHARDMILL_ANNOTATOR_PROGRAM", "/usr/bin/annotate");
        std::env::set_var("SHARDMILL_ANNOTATOR_COMPRESSION", "none");

        let config = valid_config().with_env_overrides();

        assert_eq!(config.store.backend, StoreBackendType::S3);
        assert_eq!(
            config.store.s3.as_ref().and_then(|s| s.endpoint.as_deref()),
            Some("http://localhost:9000")
        );
        assert_eq!(config.layout.version, "v2.0.0");
        assert_eq!(config.scheduler.workers, 16);
        assert_eq!(config.scheduler.ordering, OrderingPolicy::Recency);
        assert_eq!(config.annotator.program, "/usr/bin/annotate");
        assert_eq!(config.annotator.compression, OutputCompression::None);

        clear_shardmill_env_vars();

        // Invalid values are ignored
        std::env::set_var("SHARDMILL_SCHEDULER_WORKERS", "many");
        let config = valid_config().with_env_overrides();
        assert_eq!(config.scheduler.workers, 4);

        clear_shardmill_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = valid_config();
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: PipelineConfig = toml_str.parse().unwrap();

        assert_eq!(original.layout.model_id, parsed.layout.model_id);
        assert_eq!(original.stamps.build_dir, parsed.stamps.build_dir);
        assert_eq!(original.scheduler.workers, parsed.scheduler.workers);
        assert_eq!(original.annotator.args, parsed.annotator.args);
    }
}
