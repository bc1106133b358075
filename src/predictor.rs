//! Boundary to the external segmentation model.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("no predictor command configured")]
    NotConfigured,

    #[error("failed to launch predictor {program}: {source}")]
    Launch { program: String, source: io::Error },

    #[error("predictor exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("predictor produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Turns an input image into a label volume file.
///
/// Implementations must overwrite any existing output and may take minutes;
/// they are only ever called from the pipeline worker.
pub trait Predictor: Send {
    /// Segment `input` and return the path of the written label volume.
    /// `output_hint` is where the volume should go; an implementation may
    /// append a compression suffix (`.gz`) and return that path instead.
    fn predict(&self, input: &Path, output_hint: &Path) -> Result<PathBuf, PredictorError>;
}

/// Runs a segmentation command line.
///
/// `{input}` and `{output}` in the arguments are replaced by the image and
/// output paths. The environment is passed explicitly to the child process
/// instead of being set on the current process.
#[derive(Debug, Clone, Default)]
pub struct CommandPredictor {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandPredictor {
    pub fn new(program: impl Into<String>, args: Vec<String>, env: BTreeMap<String, String>) -> Self {
        Self {
            program: program.into(),
            args,
            env,
        }
    }

    fn expand(&self, input: &Path, output: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .into()
            })
            .collect()
    }
}

impl Predictor for CommandPredictor {
    fn predict(&self, input: &Path, output_hint: &Path) -> Result<PathBuf, PredictorError> {
        if self.program.is_empty() {
            return Err(PredictorError::NotConfigured);
        }
        if let Some(parent) = output_hint.parent() {
            fs::create_dir_all(parent)?;
        }
        let gz_hint = compressed_path(output_hint);
        for stale in [output_hint, gz_hint.as_path()] {
            if stale.exists() {
                debug!(path = %stale.display(), "removing previous prediction");
                fs::remove_file(stale)?;
            }
        }

        let args = self.expand(input, output_hint);
        info!(program = %self.program, input = %input.display(), "running segmentation");
        let output = Command::new(&self.program)
            .args(&args)
            .envs(&self.env)
            .output()
            .map_err(|source| PredictorError::Launch {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(PredictorError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        resolve_output(output_hint)
    }
}

fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

/// The written label volume: `<hint>.gz` if present, else the hint itself.
pub fn resolve_output(output_hint: &Path) -> Result<PathBuf, PredictorError> {
    let gz = compressed_path(output_hint);
    if gz.is_file() {
        Ok(gz)
    } else if output_hint.is_file() {
        Ok(output_hint.to_path_buf())
    } else {
        Err(PredictorError::MissingOutput(output_hint.to_path_buf()))
    }
}
