use thiserror::Error;

macro_rules! image_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::ImageParse {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::ImageParse {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every step of a load (namespace resolution, buffer acquisition, execute-rights escalation,
/// mapping and image parsing) reports its failure through one of these variants. No step retries,
/// and no partially loaded resource is ever handed back alongside an error.
///
/// # Error Categories
///
/// ## Caller Errors
/// - [`Error::RootAnchoredPath`] - A path starting with `/` was passed; it would escape the namespace
///
/// ## Environmental Errors
/// - [`Error::Namespace`] - The namespace root directory could not be opened
/// - [`Error::Acquisition`] - The resource could not be opened or sized
/// - [`Error::PermissionEscalation`] - Execute rights could not be granted to a buffer
/// - [`Error::Mapping`] - The buffer could not be mapped into the address space
///
/// ## Image Errors
/// - [`Error::ImageParse`] - The executable image is truncated or malformed
/// - [`Error::GoblinErr`] - Low-level ELF parsing errors from goblin
///
/// # Examples
///
/// ```rust,no_run
/// use snapmap::{Error, MappedResource};
///
/// match MappedResource::load_from_namespace(None, "data/vm_snapshot.bin", false) {
///     Ok(resource) => println!("mapped {} bytes", resource.size()),
///     Err(Error::RootAnchoredPath(path)) => panic!("caller bug: {path}"),
///     Err(Error::Acquisition { path, source }) => eprintln!("{path}: {source}"),
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The path handed to a namespace lookup starts with a root separator.
    ///
    /// `openat` ignores the directory descriptor for absolute paths, so such a path would
    /// silently bypass the namespace. This always indicates a bug in the calling code and is
    /// rejected before any filesystem access happens.
    #[error("Path must be relative to the namespace - {0}")]
    RootAnchoredPath(String),

    /// The root directory of a namespace could not be opened.
    #[error("Failed to open namespace directory - {0}")]
    Namespace(#[source] std::io::Error),

    /// A resource could not be obtained from its directory.
    ///
    /// Covers missing files, permission problems and I/O errors while opening or sizing a
    /// resource, for both the buffer path and the executable descriptor path.
    #[error("Failed to acquire {path} - {source}")]
    Acquisition {
        /// The path that was looked up
        path: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A buffer could not be granted execute rights.
    ///
    /// Callers that asked for an executable mapping get this error; they never receive a
    /// read-only mapping in its place.
    #[error("Failed to make {path} executable - {message}")]
    PermissionEscalation {
        /// The resource that was being escalated
        path: String,
        /// Description of why the escalation was refused
        message: String,
    },

    /// Mapping a buffer into the address space failed.
    #[error("Failed to map {path} - {message}")]
    Mapping {
        /// The resource that was being mapped
        path: String,
        /// Description of the mapping failure
        message: String,
    },

    /// The executable image could not be parsed or loaded.
    ///
    /// Includes the source location where the problem was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Failed load ELF - {file}:{line}: {message}")]
    ImageParse {
        /// The message to be printed for the ImageParse error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Error from the goblin crate during ELF parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// An out of bound access was attempted on a mapped region.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,
}

impl Error {
    /// Returns `true` for failures caused by the calling code rather than the environment.
    #[must_use]
    pub fn is_caller_bug(&self) -> bool {
        matches!(self, Error::RootAnchoredPath(_))
    }
}
