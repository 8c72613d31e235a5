//! Crate-wide error type.

/// Errors raised by the builder.
///
/// One error kind carries the human-readable context; the variants exist
/// for presentation and for callers that need to distinguish preflight
/// faults from build faults.
#[derive(Debug)]
pub enum Error {
    /// The build manifest could not be located.
    MissingManifest,
    /// The build manifest failed schema validation.
    InvalidManifest(String),
    /// Required host binaries are absent.
    MissingPackages(Vec<String>),
    /// A subprocess exited with a non-zero status.
    CommandFailed {
        /// The command line that was executed.
        command: String,
        /// The exit code (-1 when killed by a signal).
        code: i32,
        /// Captured stderr of the failing command.
        stderr: String,
    },
    /// A consistency check on the assembled rootfs failed.
    IntegrityFailure(String),
    /// Any other fatal condition, with a human message.
    Call(String),
    /// An I/O error.
    Io(std::io::Error),
    /// An HTTP error while fetching repository metadata.
    Http(reqwest::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::MissingManifest => write!(f, "Unable to locate manifest file"),
            Error::InvalidManifest(msg) => write!(f, "Invalid manifest file: {}", msg),
            Error::MissingPackages(packages) => write!(
                f,
                "Failed preflight check. Please install {:?} packages.",
                packages.join(", ")
            ),
            Error::CommandFailed {
                command,
                code,
                stderr,
            } => {
                write!(
                    f,
                    "Command {:?} failed with exit code {}: {}",
                    command,
                    code,
                    stderr.trim_end()
                )
            }
            Error::IntegrityFailure(msg) => write!(f, "Integrity failure: {}", msg),
            Error::Call(msg) => write!(f, "{}", msg),
            Error::Io(e) => write!(f, "{}", e),
            Error::Http(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::InvalidManifest(e.to_string())
    }
}
