// rust/shardmill-core/src/work/annotator.rs

//! Interface to the external annotation step.
//!
//! The annotator is a black box: given a raw document shard and its language
//! identification shard it produces an annotated shard and a log, declines
//! because the output already exists remotely, or fails.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::AnnotatorConfig;
use crate::error::{Result, ShardmillError};
use crate::layout::{RemotePath, ShardKey};

/// Longest stderr excerpt carried in a failure reason.
const REASON_TAIL_BYTES: usize = 512;

/// One annotation job: two local inputs and where to put the results.
#[derive(Debug, Clone)]
pub struct AnnotationRequest {
    pub key: ShardKey,
    /// Raw document shard.
    pub input: PathBuf,
    /// Language identification shard.
    pub lid: PathBuf,
    /// Local path the annotated shard must be written to.
    pub output: PathBuf,
    /// Local path of the execution log.
    pub log: PathBuf,
    /// Final remote location of the output, for the annotator's own existence check.
    pub remote_output: RemotePath,
}

/// How an annotation attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationStatus {
    /// The output was written and is ready to publish.
    Success,
    /// The remote output already exists; nothing was computed.
    SkipOutputExists,
    /// Output was produced but did not pass validation.
    ValidationFailed(String),
    Failed(String),
}

/// The annotation collaborator.
#[async_trait]
pub trait Annotator: Send + Sync {
    /// Runs one annotation job.
    ///
    /// # Errors
    ///
    /// Returns an error only if the job could not be started at all; every
    /// outcome of a started job is an [`AnnotationStatus`].
    async fn annotate(&self, request: &AnnotationRequest) -> Result<AnnotationStatus>;
}

/// Runs an external program once per job and maps its exit status.
///
/// Arguments are templates: `{input}`, `{lid}`, `{output}`, `{log}`, `{key}`,
/// `{collection}`, `{sub_unit}` and `{remote_output}` are substituted. If the
/// program does not write the log itself, its stdout and stderr become the log.
#[derive(Debug, Clone)]
pub struct CommandAnnotator {
    program: String,
    args: Vec<String>,
    skip_exit_code: i32,
    validation_exit_code: Option<i32>,
}

impl CommandAnnotator {
    pub fn new(config: &AnnotatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            program: config.program.clone(),
            args: config.args.clone(),
            skip_exit_code: config.skip_exit_code,
            validation_exit_code: config.validation_exit_code,
        })
    }

    fn render_args(&self, request: &AnnotationRequest) -> Vec<String> {
        let remote_output = request.remote_output.to_string();
        let key = request.key.to_string();
        let substitutions = [
            ("{input}", request.input.to_string_lossy()),
            ("{lid}", request.lid.to_string_lossy()),
            ("{output}", request.output.to_string_lossy()),
            ("{log}", request.log.to_string_lossy()),
            ("{key}", key.as_str().into()),
            ("{collection}", request.key.collection.as_str().into()),
            ("{sub_unit}", request.key.sub_unit.as_str().into()),
            ("{remote_output}", remote_output.as_str().into()),
        ];

        self.args
            .iter()
            .map(|arg| {
                substitutions
                    .iter()
                    .fold(arg.clone(), |acc, (pattern, value)| acc.replace(pattern, value))
            })
            .collect()
    }

    fn classify(&self, code: Option<i32>, stderr: &[u8]) -> AnnotationStatus {
        match code {
            Some(0) => AnnotationStatus::Success,
            Some(code) if code == self.skip_exit_code => AnnotationStatus::SkipOutputExists,
            Some(code) if Some(code) == self.validation_exit_code => {
                AnnotationStatus::ValidationFailed(tail(stderr))
            }
            Some(code) => {
                AnnotationStatus::Failed(format!("exited with code {code}: {}", tail(stderr)))
            }
            None => AnnotationStatus::Failed("terminated by signal".to_string()),
        }
    }
}

#[async_trait]
impl Annotator for CommandAnnotator {
    async fn annotate(&self, request: &AnnotationRequest) -> Result<AnnotationStatus> {
        let args = self.render_args(request);
        tracing::debug!(program = %self.program, ?args, key = %request.key, "running annotator");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ShardmillError::annotator_with_source(
                    format!("failed to start '{}'", self.program),
                    e,
                )
            })?;

        let log_exists = tokio::fs::try_exists(&request.log).await.unwrap_or(false);
        if !log_exists {
            let mut log = output.stdout.clone();
            log.extend_from_slice(&output.stderr);
            tokio::fs::write(&request.log, log).await.map_err(|e| {
                ShardmillError::annotator_with_source(
                    format!("failed to write log '{}'", request.log.display()),
                    e,
                )
            })?;
        }

        Ok(self.classify(output.status.code(), &output.stderr))
    }
}

/// Last few hundred bytes of `stderr`, trimmed, as text.
fn tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(REASON_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: &std::path::Path) -> AnnotationRequest {
        AnnotationRequest {
            key: ShardKey::new("A", "1900"),
            input: dir.join("in.jsonl.bz2"),
            lid: dir.join("lid.jsonl.bz2"),
            output: dir.join("out.jsonl.bz2"),
            log: dir.join("out.log"),
            remote_output: RemotePath::new("out", "run/A/A-1900.jsonl.bz2"),
        }
    }

    fn shell(script: &str) -> CommandAnnotator {
        CommandAnnotator::new(&AnnotatorConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "annotate".to_string()],
            skip_exit_code: 3,
            validation_exit_code: Some(4),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_render_args() {
        let annotator = CommandAnnotator::new(&AnnotatorConfig {
            program: "annotate".to_string(),
            args: vec![
                "{input}".to_string(),
                "--lid={lid}".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
                "--check".to_string(),
                "s3://{remote_output}".to_string(),
                "{collection}:{sub_unit}:{key}".to_string(),
            ],
            ..Default::default()
        })
        .unwrap();

        let req = request(std::path::Path::new("/w"));
        let args = annotator.render_args(&req);
        assert_eq!(
            args,
            vec![
                "/w/in.jsonl.bz2",
                "--lid=/w/lid.jsonl.bz2",
                "-o",
                "/w/out.jsonl.bz2",
                "--check",
                "s3://out/run/A/A-1900.jsonl.bz2",
                "A:1900:A-1900",
            ]
        );
    }

    #[test]
    fn test_empty_program_rejected() {
        assert!(CommandAnnotator::new(&AnnotatorConfig::default()).is_err());
    }

    #[test]
    fn test_classify() {
        let annotator = shell("true");
        assert_eq!(annotator.classify(Some(0), b""), AnnotationStatus::Success);
        assert_eq!(annotator.classify(Some(3), b""), AnnotationStatus::SkipOutputExists);
        assert_eq!(
            annotator.classify(Some(4), b"bad schema\n"),
            AnnotationStatus::ValidationFailed("bad schema".to_string())
        );
        assert!(matches!(
            annotator.classify(Some(1), b"boom"),
            AnnotationStatus::Failed(m) if m.contains("boom")
        ));
        assert!(matches!(annotator.classify(None, b""), AnnotationStatus::Failed(_)));
    }

    #[test]
    fn test_tail_is_bounded() {
        let long = vec![b'x'; REASON_TAIL_BYTES * 3];
        assert_eq!(tail(&long).len(), REASON_TAIL_BYTES);
    }

    #[tokio::test]
    async fn test_success_writes_output_and_captured_log() {
        let temp = TempDir::new().unwrap();
        let req = request(temp.path());
        let annotator = CommandAnnotator::new(&AnnotatorConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo annotated > \"$1\"; echo progress >&2".to_string(),
                "annotate".to_string(),
                "{output}".to_string(),
            ],
            ..Default::default()
        })
        .unwrap();

        let status = annotator.annotate(&req).await.unwrap();
        assert_eq!(status, AnnotationStatus::Success);
        assert_eq!(std::fs::read_to_string(&req.output).unwrap(), "annotated\n");
        assert_eq!(std::fs::read_to_string(&req.log).unwrap(), "progress\n");
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let temp = TempDir::new().unwrap();
        let req = request(temp.path());

        assert_eq!(
            shell("exit 3").annotate(&req).await.unwrap(),
            AnnotationStatus::SkipOutputExists
        );
        assert!(matches!(
            shell("echo invalid >&2; exit 4").annotate(&req).await.unwrap(),
            AnnotationStatus::ValidationFailed(m) if m == "invalid"
        ));
        assert!(matches!(
            shell("exit 1").annotate(&req).await.unwrap(),
            AnnotationStatus::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_program_written_log_is_kept() {
        let temp = TempDir::new().unwrap();
        let req = request(temp.path());
        std::fs::write(&req.log, "own log").unwrap();

        shell("echo noise >&2").annotate(&req).await.unwrap();
        assert_eq!(std::fs::read_to_string(&req.log).unwrap(), "own log");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let temp = TempDir::new().unwrap();
        let annotator = CommandAnnotator::new(&AnnotatorConfig {
            program: "/nonexistent/annotator".to_string(),
            ..Default::default()
        })
        .unwrap();
        let err = annotator.annotate(&request(temp.path())).await.unwrap_err();
        assert!(matches!(err, ShardmillError::Annotator { .. }));
    }
}
