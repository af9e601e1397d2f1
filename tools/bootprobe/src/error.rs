//! Failure taxonomy of the harness pipeline.
//!
//! Every stage returns [`HarnessError`]; the CLI maps each variant to a
//! distinct process exit status via [`HarnessError::exit_code`].

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Exit status for configuration problems and anything not listed below.
pub const EXIT_OTHER: u8 = 1;
pub const EXIT_BUILD: u8 = 2;
pub const EXIT_MEDIA: u8 = 3;
pub const EXIT_LAUNCH: u8 = 4;
pub const EXIT_TIMEOUT: u8 = 5;
pub const EXIT_CONNECT: u8 = 6;
pub const EXIT_PROTOCOL: u8 = 7;
pub const EXIT_CONNECTION_LOST: u8 = 8;

/// A failed pipeline stage.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("build of `{package}` failed")]
    BuildFailure {
        package: String,
        #[source]
        source: BuildError,
    },

    #[error("boot media assembly failed")]
    MediaAssembly(#[from] MediaError),

    #[error("emulator launch failed")]
    Launch(#[from] LaunchError),

    #[error("debug stub at {endpoint} is not accepting connections")]
    Connection {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("remote protocol error: {0}")]
    Protocol(String),

    #[error("`{symbol}` was not reached within {timeout:?}")]
    VerificationTimeout { symbol: String, timeout: Duration },

    #[error("connection to debug stub lost: {0}")]
    ConnectionLost(String),
}

impl HarnessError {
    /// The process exit status reported for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::BuildFailure { .. } => EXIT_BUILD,
            Self::MediaAssembly(_) => EXIT_MEDIA,
            Self::Launch(_) => EXIT_LAUNCH,
            Self::Connection { .. } => EXIT_CONNECT,
            Self::Protocol(_) => EXIT_PROTOCOL,
            Self::VerificationTimeout { .. } => EXIT_TIMEOUT,
            Self::ConnectionLost(_) => EXIT_CONNECTION_LOST,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Why a toolchain invocation did not yield an artifact.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("could not run `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    #[error("toolchain exited with {status}\n{output}")]
    Toolchain { status: ExitStatus, output: String },

    #[error("toolchain succeeded but {} does not exist", path.display())]
    ArtifactMissing { path: PathBuf },

    #[error("cannot read symbols from {}: {reason}", path.display())]
    Symbols { path: PathBuf, reason: String },
}

/// Boot media could not be assembled.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{role} not found at {}", path.display())]
    MissingSource { role: &'static str, path: PathBuf },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The emulator could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("emulator binary `{binary}` not found")]
    BinaryMissing { binary: String },

    #[error("emulator exited immediately ({status})\n{stderr}")]
    ExitedImmediately { status: ExitStatus, stderr: String },

    #[error("{what}: {source}")]
    Io {
        what: String,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    pub(crate) fn io(what: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let what = what.into();
        move |source| Self::Io { what, source }
    }
}
