use core::fmt;
use rustix::io::Errno;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A caller-supplied input violated a precondition.
    ///
    /// This error code is used for a zero-length request to `map` and for a
    /// partial or unknown view handed to `unmap`. It is always detected
    /// before any syscall is issued, so the registry is left untouched.
    InvalidArgument,
    /// The underlying platform call failed.
    ///
    /// The OS error code is carried verbatim; use
    /// [`raw_os_error`](Error::raw_os_error) to recover the numeric value.
    Os(Errno),
}

impl Error {
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Os(errno) => Some(errno.raw_os_error()),
            Error::InvalidArgument => None,
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Os(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => f.write_str("invalid argument"),
            Error::Os(errno) => f.write_fmt(format_args!("os error: {errno}")),
        }
    }
}

impl core::error::Error for Error {}
