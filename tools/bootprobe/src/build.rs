//! Kernel and bootloader builds.
//!
//! Runs the toolchain (`cargo build` by default) in the package directory and
//! checks that the artifact landed where the target/profile layout says it
//! should. Prior outputs are never cleaned; cargo's incremental state is
//! reused between runs.

use std::collections::BTreeSet;
use std::path::PathBuf;

use xshell::Shell;

use crate::error::{BuildError, HarnessError};
use crate::symbols::SymbolTable;
use crate::verbose::{dprintln, vprintln};

/// One toolchain invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Program to run (`cargo`).
    pub toolchain: String,
    /// Working directory.
    pub dir: PathBuf,
    pub package: String,
    /// File name of the produced binary.
    pub binary: String,
    /// Target triple.
    pub target: String,
    pub features: BTreeSet<String>,
    pub release: bool,
    /// Pass `-Zbuild-std` for targets without a prebuilt `core`.
    pub build_std: bool,
    pub target_dir: PathBuf,
}

impl BuildConfig {
    /// Arguments passed to the toolchain.
    pub fn toolchain_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "build".into(),
            "-p".into(),
            self.package.clone(),
            "--target".into(),
            self.target.clone(),
            "--target-dir".into(),
            self.target_dir.display().to_string(),
        ];

        if !self.features.is_empty() {
            let features: Vec<&str> = self.features.iter().map(String::as_str).collect();
            args.push("--features".into());
            args.push(features.join(","));
        }

        if self.build_std {
            args.push("-Zbuild-std=core,compiler_builtins,alloc".into());
            args.push("-Zbuild-std-features=compiler-builtins-mem".into());
        }

        if self.release {
            args.push("--release".into());
        }

        args
    }

    /// `<target-dir>/<target>/<profile>/<binary>`.
    pub fn artifact_path(&self) -> PathBuf {
        let profile = if self.release { "release" } else { "debug" };
        self.target_dir
            .join(&self.target)
            .join(profile)
            .join(&self.binary)
    }

    fn failure(&self, source: BuildError) -> HarnessError {
        HarnessError::BuildFailure {
            package: self.package.clone(),
            source,
        }
    }
}

/// A built kernel and its symbols.
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub binary: PathBuf,
    pub symbols: SymbolTable,
}

/// Run the toolchain and return the artifact path.
///
/// Fails unless the toolchain exits zero *and* the artifact exists.
pub fn build_binary(config: &BuildConfig) -> Result<PathBuf, HarnessError> {
    dprintln!("Building {} for {}", config.package, config.target);

    let spawn_err = |reason: String| {
        config.failure(BuildError::Spawn {
            program: config.toolchain.clone(),
            reason,
        })
    };

    let sh = Shell::new().map_err(|e| spawn_err(e.to_string()))?;
    sh.change_dir(&config.dir);

    let args = config.toolchain_args();
    vprintln!("  {} {}", config.toolchain, args.join(" "));

    let output = sh
        .cmd(&config.toolchain)
        .args(&args)
        .ignore_status()
        .quiet()
        .output()
        .map_err(|e| spawn_err(e.to_string()))?;

    if !output.status.success() {
        let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        return Err(config.failure(BuildError::Toolchain {
            status: output.status,
            output: text.trim_end().to_owned(),
        }));
    }

    let path = config.artifact_path();
    if !path.is_file() {
        return Err(config.failure(BuildError::ArtifactMissing { path }));
    }
    Ok(path)
}

/// Build the kernel and load its symbol table.
pub fn build_kernel(config: &BuildConfig) -> Result<BuildArtifact, HarnessError> {
    let binary = build_binary(config)?;
    let symbols = SymbolTable::load(&binary).map_err(|reason| {
        config.failure(BuildError::Symbols {
            path: binary.clone(),
            reason,
        })
    })?;
    vprintln!("  {} symbols in {}", symbols.len(), binary.display());
    Ok(BuildArtifact { binary, symbols })
}
