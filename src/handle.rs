//! Opaque file handles.

use core::fmt::{self, Debug};

use crate::error::{self, CommandInfo, Result};
use snafu::prelude::*;

/// Identifies the session a handle was issued by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u32);

/// An opaque token for an open file or directory enumeration, issued by
/// the server.
///
/// A handle remembers the session that produced it and is rejected by
/// any other, before a packet is built. Cloning is allowed, the server
/// side state is only released by `close`.
#[derive(Clone, PartialEq, Eq)]
pub struct FileHandle {
    bytes: Vec<u8>,
    session: SessionId,
}

impl FileHandle {
    pub(crate) fn new(bytes: Vec<u8>, session: SessionId) -> Self {
        FileHandle { bytes, session }
    }

    /// The raw server-issued token
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The handle bytes, after verifying the handle belongs to `session`.
    pub(crate) fn owned_bytes(
        &self,
        session: SessionId,
        info: &CommandInfo,
    ) -> Result<&[u8]> {
        if self.session != session {
            return error::BadHandle { info: info.clone() }.fail();
        }
        Ok(&self.bytes)
    }
}

impl Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHandle(")?;
        for b in self.bytes.iter() {
            write!(f, "{b:02x}")?;
        }
        write!(f, ", session {})", self.session.0)
    }
}
