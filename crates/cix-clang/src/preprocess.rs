//! Preprocessing by invoking the source's own compiler with `-E`.

use std::path::PathBuf;
use std::time::Instant;

use cix_core::{Cpp, Source};
use cix_process::{run_command, RunOptions};

use crate::{FacadeError, Preprocessor};

/// Runs `<compiler> -E <arguments> <file>` and captures the output.
///
/// Include roots and always-appended flags from the daemon configuration are
/// folded into every invocation.
pub struct CommandPreprocessor {
    include_paths: Vec<PathBuf>,
    default_arguments: Vec<String>,
}

impl CommandPreprocessor {
    pub fn new(include_paths: Vec<PathBuf>, default_arguments: Vec<String>) -> Self {
        Self {
            include_paths,
            default_arguments,
        }
    }
}

impl Preprocessor for CommandPreprocessor {
    fn preprocess(&self, source: &Source) -> Result<Cpp, FacadeError> {
        let mut args: Vec<String> = Vec::with_capacity(source.arguments.len() + 4);
        args.push("-E".to_string());
        args.extend(source.arguments.iter().cloned());
        args.extend(self.default_arguments.iter().cloned());
        for root in &self.include_paths {
            args.push(format!("-I{}", root.display()));
        }
        args.push(source.source_file.display().to_string());

        let started = Instant::now();
        let result = run_command(
            &source.build_root,
            &source.compiler,
            &args,
            RunOptions::default(),
        )
        .map_err(|err| FacadeError::Preprocess(err.to_string()))?;

        if !result.status.success() || result.output.stdout.is_empty() {
            let detail = if result.output.stderr.is_empty() {
                format!("{} produced no output", source.compiler.display())
            } else {
                result.output.stderr
            };
            return Err(FacadeError::Preprocess(detail));
        }

        let cpp = Cpp {
            preprocessed: String::from_utf8_lossy(&result.output.stdout).into_owned(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::debug!(
            target: "cix.preprocess",
            file = %source.source_file.display(),
            bytes = cpp.preprocessed.len(),
            ms = cpp.duration_ms,
            "preprocessed"
        );
        Ok(cpp)
    }
}
