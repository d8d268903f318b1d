//! The correlation table of in-flight requests.
//!
//! Every submitted request parks a continuation here under its id; the
//! dispatcher claims the entry when the matching response arrives. The
//! table is the sole source of truth for pairing responses to requests.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::client::SftpSession;
use crate::error::CommandInfo;
use crate::proto::SftpPacket;

/// Interprets a response frame (or a local failure) and completes the
/// caller's continuation.
pub(crate) type ResponseParser = Box<
    dyn for<'p> FnOnce(&mut SftpSession, Result<SftpPacket<'p>>, &CommandInfo),
>;

/// A parked continuation with the command context it was submitted under.
pub(crate) struct Pending {
    pub parser: ResponseParser,
    pub info: CommandInfo,
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").field("info", &self.info).finish()
    }
}

/// Id 0 is reserved and id 1 bookkeeps the version handshake.
const FIRST_REQUEST_ID: u32 = 2;

pub(crate) struct RequestMap {
    next_id: u32,
    pending: HashMap<u32, Pending>,
}

impl RequestMap {
    pub fn new() -> Self {
        RequestMap { next_id: FIRST_REQUEST_ID, pending: HashMap::new() }
    }

    /// The next request id: monotonic, wrapping mod 2^32 past the
    /// reserved ids.
    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = match self.next_id.wrapping_add(1) {
            0 | 1 => FIRST_REQUEST_ID,
            n => n,
        };
        id
    }

    /// Parks a continuation. A prior entry under the same id is a
    /// programming error; the entry is handed back for failure delivery.
    pub fn park(
        &mut self,
        id: u32,
        entry: Pending,
    ) -> core::result::Result<(), Pending> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => {
                error!("duplicate outstanding request id {id}");
                Err(entry)
            }
            Entry::Vacant(v) => {
                v.insert(entry);
                Ok(())
            }
        }
    }

    /// Removes and returns the continuation for a response id.
    pub fn claim(&mut self, id: u32) -> Option<Pending> {
        self.pending.remove(&id)
    }

    /// Empties the table, returning every parked continuation.
    pub fn drain(&mut self) -> Vec<Pending> {
        self.pending.drain().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Pending {
        Pending {
            parser: Box::new(|_s, _r, _i| {}),
            info: CommandInfo::default(),
        }
    }

    #[test]
    fn ids_start_at_two() {
        let mut m = RequestMap::new();
        assert_eq!(m.next_id(), 2);
        assert_eq!(m.next_id(), 3);
    }

    #[test]
    fn ids_wrap_past_reserved() {
        let mut m = RequestMap::new();
        m.next_id = u32::MAX;
        assert_eq!(m.next_id(), u32::MAX);
        // 0 and 1 are never handed out
        assert_eq!(m.next_id(), 2);
    }

    #[test]
    fn park_claim() {
        let mut m = RequestMap::new();
        let id = m.next_id();
        assert!(m.park(id, noop()).is_ok());
        assert_eq!(m.len(), 1);
        assert!(m.claim(id).is_some());
        assert!(m.claim(id).is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut m = RequestMap::new();
        assert!(m.park(5, noop()).is_ok());
        assert!(m.park(5, noop()).is_err());
        // the original entry is untouched
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn drain_empties() {
        let mut m = RequestMap::new();
        for _ in 0..3 {
            let id = m.next_id();
            m.park(id, noop()).unwrap();
        }
        assert_eq!(m.drain().len(), 3);
        assert!(m.is_empty());
    }
}
