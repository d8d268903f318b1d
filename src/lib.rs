//! SFTP v3 client protocol core.
//!
//! Implements the client side of SFTP v3 as defined in
//! [draft-ietf-secsh-filexfer-02](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02),
//! without the SSH transport: the embedder supplies a framed byte
//! channel (an SSH `sftp` subsystem channel, or anything else that
//! carries whole frames) and pumps inbound frames into the session.
//!
//! The crate covers the wire codec, the request id multiplexer that
//! correlates concurrent requests to their responses, extension
//! negotiation with feature gating (`posix-rename@openssh.com`,
//! `hardlink@openssh.com`, `copy-data`, `check-file-handle`,
//! `statvfs@openssh.com` and friends), and the filesystem operation
//! surface from `open`/`read`/`write` through directory enumeration,
//! links and server-side hashing.
//!
//! ```no_run
//! use lowtide::{ChannelSink, Result, SftpSession};
//!
//! struct Subsystem; // the embedder's channel
//! impl ChannelSink for Subsystem {
//!     fn send(&mut self, frame: &[u8]) -> Result<()> {
//!         // hand the frame to the transport
//!         Ok(())
//!     }
//! }
//!
//! fn run() -> Result<()> {
//!     let mut sftp = SftpSession::default();
//!     sftp.bind(Box::new(Subsystem), |sftp, r| {
//!         r.unwrap();
//!         sftp.stat("/etc/motd", |_sftp, attrs| {
//!             println!("{:?}", attrs);
//!         })
//!         .unwrap();
//!     })?;
//!     // feed frames from the transport:
//!     // sftp.handle_message(&frame)?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
// avoids headscratching
#![deny(unused_must_use)]

pub mod attrs;
pub mod config;
pub mod error;
pub mod extensions;
pub mod flags;
pub mod proto;
pub mod sshwire;

mod client;
mod handle;
mod lowtidelog;
mod requests;

// Application API
pub use attrs::{Attrs, FileType, MetaValue, Metadata};
pub use client::{ChannelSink, FileHash, SftpSession, RENAME_OVERWRITE};
pub use config::Limits;
pub use error::{CommandInfo, Error, Result};
pub use extensions::{ExtensionMap, Feature, FeatureSet};
pub use handle::FileHandle;
pub use proto::{DirEntry, StatVfs, StatusCode};
