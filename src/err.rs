use std::path::{Path, PathBuf};
use std::{error, fmt, io};

#[derive(Debug)]
pub enum Error {
    File {
        op: String,
        name: PathBuf,
        io: io::Error,
    },
    OS {
        op: String,
        io: io::Error,
    },
    Invalid {
        name: String,
    },
    NotFound {
        name: String,
    },
    Exists {
        name: String,
    },
    Child {
        what: String,
        code: i32,
    },
    Refused {
        why: String,
    },
    BadStr,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Annotate I/O error
    pub fn file<S: AsRef<str>, P: AsRef<Path>>(desc: S, path: P, err: io::Error) -> Self {
        Error::File {
            op: desc.as_ref().to_string(),
            name: path.as_ref().to_path_buf(),
            io: err,
        }
    }

    /// Annotate Error::last_os_error()
    pub fn last_file_error<S: AsRef<str>, P: AsRef<Path>>(desc: S, path: P) -> Self {
        Self::file(desc, path, io::Error::last_os_error())
    }

    pub fn os<S: AsRef<str>>(desc: S, err: io::Error) -> Self {
        Self::OS {
            op: desc.as_ref().to_string(),
            io: err,
        }
    }

    /// Annotate Error::last_os_error()
    pub fn last_os_error<S: AsRef<str>>(desc: S) -> Self {
        Self::os(desc, io::Error::last_os_error())
    }

    pub fn child<S: AsRef<str>>(what: S, code: i32) -> Self {
        Self::Child {
            what: what.as_ref().to_string(),
            code,
        }
    }

    pub fn refused<S: AsRef<str>>(why: S) -> Self {
        Self::Refused {
            why: why.as_ref().to_string(),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::File { io, .. } => Some(io),
            Self::OS { io, .. } => Some(io),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { op, name, io } => {
                write!(f, "{} {} : {}", op, name.display(), io)
            }
            Self::OS { op, io } => write!(f, "{} : {}", op, io),
            Self::Invalid { name } => write!(f, "invalid sandbox name {}", name),
            Self::NotFound { name } => write!(f, "sandbox {} does not exist", name),
            Self::Exists { name } => write!(f, "sandbox {} exists", name),
            Self::Child { what, code } => write!(f, "{} exited with {}", what, code),
            Self::Refused { why } => write!(f, "{}", why),
            Self::BadStr => write!(f, "String can not contain nil"),
        }
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(_inp: std::ffi::NulError) -> Self {
        Error::BadStr
    }
}
