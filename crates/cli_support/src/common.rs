use clap::Args;
use std::path::{Path, PathBuf};

/// Run output options shared by binaries that write into a run directory.
#[derive(Debug, Clone, Default, Args)]
pub struct RunOutputArgs {
    /// Directory holding one subdirectory per model name.
    #[arg(long)]
    pub output_root: Option<PathBuf>,
    /// Name of the run; checkpoint, log and metrics land in `<output_root>/<model_name>/`.
    #[arg(long)]
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutputOpts {
    pub output_root: Option<PathBuf>,
    pub model_name: Option<String>,
}

impl RunOutputOpts {
    pub fn new(output_root: Option<PathBuf>, model_name: Option<String>) -> Self {
        Self {
            output_root,
            model_name,
        }
    }

    /// Flags win over the configured values.
    pub fn resolve(&self, output_root: &Path, model_name: &str) -> (PathBuf, String) {
        (
            self.output_root
                .clone()
                .unwrap_or_else(|| output_root.to_path_buf()),
            self.model_name
                .clone()
                .unwrap_or_else(|| model_name.to_string()),
        )
    }
}

impl From<&RunOutputArgs> for RunOutputOpts {
    fn from(args: &RunOutputArgs) -> Self {
        Self::new(args.output_root.clone(), args.model_name.clone())
    }
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to `info`.
/// A second call is a no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
}
