//! Error types.

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use core::fmt::{self, Arguments};

use snafu::prelude::*;

use crate::proto::StatusCode;

/// Context an operation was started with, used to enrich errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandInfo {
    /// Operation name, e.g. `"open"`
    pub command: &'static str,
    pub path: Option<String>,
    /// Target path of two-path operations (rename, symlink, link)
    pub target: Option<String>,
    /// Hex dump of the server handle an operation ran against
    pub handle: Option<String>,
}

impl CommandInfo {
    pub fn path(command: &'static str, path: &str) -> Self {
        CommandInfo { command, path: Some(path.into()), ..Default::default() }
    }

    pub fn two_paths(command: &'static str, path: &str, target: &str) -> Self {
        CommandInfo {
            command,
            path: Some(path.into()),
            target: Some(target.into()),
            ..Default::default()
        }
    }

    pub fn handle(command: &'static str, handle: &[u8]) -> Self {
        CommandInfo {
            command,
            handle: Some(hex_string(handle)),
            ..Default::default()
        }
    }
}

fn hex_string(b: &[u8]) -> String {
    b.iter().map(|v| format!("{v:02x}")).collect()
}

impl fmt::Display for CommandInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        if let Some(p) = self.path.as_deref() {
            write!(f, " {p}")?;
        }
        if let Some(t) = self.target.as_deref() {
            write!(f, " -> {t}")?;
        }
        if let Some(h) = self.handle.as_deref() {
            write!(f, " handle {h}")?;
        }
        Ok(())
    }
}

/// The lowtide error type.
#[non_exhaustive]
#[derive(Snafu, Debug)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum Error {
    /// Output buffer ran out of room
    NoRoom,

    /// Input ran out inside a packet field
    RanOut,

    /// Not a UTF-8 string
    BadString,

    /// Received packet at a disallowed time, or of an unexpected type
    PacketWrong,

    /// Error in the received SFTP protocol. Ends the session.
    SSHProtoError,

    #[snafu(display("Unknown packet type {number}"))]
    UnknownPacket { number: u8 },

    /// Server spoke a version other than 3
    #[snafu(display("Unsupported SFTP version {version}"))]
    BadVersion { version: u32 },

    /// The session has no bound channel
    NoConnection,

    /// A non-OK status from the server, or a status shaped condition
    /// raised locally (unsupported operation, lost connection)
    #[snafu(display("{info}: {message} ({code:?})"))]
    Status { code: StatusCode, message: String, info: CommandInfo },

    /// A handle from a different or closed session was presented
    #[snafu(display("{info}: invalid handle"))]
    BadHandle { info: CommandInfo },

    /// Bad application usage
    #[snafu(display("Bad usage: {what}"))]
    BadUsage { what: &'static str },

    /// Consecutive empty reads exhausted the retry budget
    #[snafu(display("{info}: empty read limit reached"))]
    EmptyReadLimit { info: CommandInfo },

    /// Program bug
    Bug,
}

/// Symbolic error kind and errno for a status code.
///
/// The errno values are the portable table the facade exposes, not the
/// host platform's.
pub fn status_errno(code: StatusCode) -> (&'static str, i32) {
    match code {
        StatusCode::SSH_FX_EOF => ("EOF", 1),
        StatusCode::SSH_FX_NO_SUCH_FILE => ("ENOENT", 34),
        StatusCode::SSH_FX_PERMISSION_DENIED => ("EACCES", 3),
        StatusCode::SSH_FX_NO_CONNECTION => ("ENOTCONN", 31),
        StatusCode::SSH_FX_CONNECTION_LOST => ("ESHUTDOWN", 46),
        StatusCode::SSH_FX_OP_UNSUPPORTED => ("ENOSYS", 35),
        StatusCode::SSH_FX_OK
        | StatusCode::SSH_FX_FAILURE
        | StatusCode::SSH_FX_BAD_MESSAGE => ("EFAILURE", -2),
        StatusCode::Other(_) => ("UNKNOWN", -1),
    }
}

impl Error {
    /// An error for a non-OK server status
    pub fn status(
        code: StatusCode,
        message: impl Into<String>,
        info: &CommandInfo,
    ) -> Error {
        Error::Status { code, message: message.into(), info: info.clone() }
    }

    /// A locally raised `SSH_FX_OP_UNSUPPORTED`
    pub fn unsupported(info: &CommandInfo) -> Error {
        Error::status(
            StatusCode::SSH_FX_OP_UNSUPPORTED,
            "operation unsupported by the server",
            info,
        )
    }

    /// A locally raised `SSH_FX_CONNECTION_LOST`
    pub fn connection_lost(info: &CommandInfo) -> Error {
        Error::status(StatusCode::SSH_FX_CONNECTION_LOST, "connection lost", info)
    }

    /// A locally raised `SSH_FX_NO_CONNECTION`
    pub fn no_connection(info: &CommandInfo) -> Error {
        Error::status(StatusCode::SSH_FX_NO_CONNECTION, "no connection", info)
    }

    /// The symbolic error kind surfaced at the facade
    pub fn code(&self) -> &'static str {
        match self {
            Error::Status { code, .. } => status_errno(*code).0,
            Error::NoConnection => "ENOTCONN",
            Error::EmptyReadLimit { .. } => "EIO",
            Error::Bug => "UNKNOWN",
            _ => "EFAILURE",
        }
    }

    /// The portable errno surfaced at the facade
    pub fn errno(&self) -> i32 {
        match self {
            Error::Status { code, .. } => status_errno(*code).1,
            Error::NoConnection => 31,
            Error::EmptyReadLimit { .. } => 55,
            Error::Bug => -1,
            _ => -2,
        }
    }

    /// The native status code if the server sent one
    pub fn native_code(&self) -> Option<u32> {
        match self {
            Error::Status { code, .. } => Some(code.number()),
            _ => None,
        }
    }

    pub fn msg(m: &'static str) -> Error {
        Error::BadUsage { what: m }
    }

    #[cold]
    /// Panics in debug builds, returns [`Error::Bug`] in release.
    pub fn bug() -> Error {
        // Easier to track the source of errors in development,
        // but release builds shouldn't panic.
        if cfg!(debug_assertions) {
            panic!("Hit a bug");
        } else {
            Error::Bug
        }
    }

    /// Like [`bug()`](Error::bug) but with a message
    ///
    /// The message can be used instead of a code comment, is logged at
    /// `trace` level.
    #[cold]
    pub fn bug_fmt(args: Arguments) -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug: {args}");
        } else {
            trace!("Hit a bug: {args}");
            Error::Bug
        }
    }
}

/// A lowtide-specific Result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub trait TrapBug<T> {
    /// `.trap()` should be used like `.unwrap()`, in situations
    /// never expected to fail. Instead it calls [`Error::bug()`].
    /// (or debug builds may panic)
    fn trap(self) -> Result<T, Error>;

    /// Like `trap()` but with a message, the message can be used
    /// instead of a comment.
    fn trap_msg(self, args: Arguments) -> Result<T, Error>;
}

impl<T, E> TrapBug<T> for Result<T, E> {
    fn trap(self) -> Result<T, Error> {
        // call directly so that Location::caller() works
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl<T> TrapBug<T> for Option<T> {
    fn trap(self) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_table() {
        let info = CommandInfo::path("stat", "/x");
        let cases = [
            (StatusCode::SSH_FX_EOF, "EOF", 1),
            (StatusCode::SSH_FX_NO_SUCH_FILE, "ENOENT", 34),
            (StatusCode::SSH_FX_PERMISSION_DENIED, "EACCES", 3),
            (StatusCode::SSH_FX_NO_CONNECTION, "ENOTCONN", 31),
            (StatusCode::SSH_FX_CONNECTION_LOST, "ESHUTDOWN", 46),
            (StatusCode::SSH_FX_OP_UNSUPPORTED, "ENOSYS", 35),
            (StatusCode::SSH_FX_OK, "EFAILURE", -2),
            (StatusCode::SSH_FX_FAILURE, "EFAILURE", -2),
            (StatusCode::SSH_FX_BAD_MESSAGE, "EFAILURE", -2),
            (StatusCode::Other(99), "UNKNOWN", -1),
        ];
        for (code, sym, errno) in cases {
            let e = Error::status(code, "x", &info);
            assert_eq!(e.code(), sym, "{code:?}");
            assert_eq!(e.errno(), errno, "{code:?}");
            assert_eq!(e.native_code(), Some(code.number()));
        }
    }

    #[test]
    fn display_carries_command_info() {
        let info = CommandInfo::two_paths("rename", "/a", "/b");
        let e = Error::status(StatusCode::SSH_FX_FAILURE, "exists", &info);
        let s = e.to_string();
        assert!(s.contains("rename"), "{s}");
        assert!(s.contains("/a"), "{s}");
        assert!(s.contains("/b"), "{s}");
        assert!(s.contains("exists"), "{s}");
    }

    #[test]
    fn empty_read_is_eio() {
        let e =
            Error::EmptyReadLimit { info: CommandInfo::handle("read", &[0xab]) };
        assert_eq!(e.code(), "EIO");
        assert_eq!(e.errno(), 55);
        assert_eq!(e.native_code(), None);
    }
}
