//! The SFTP client session.
//!
//! [`SftpSession`] speaks SFTP v3 over a framed byte channel supplied by
//! the embedder. It performs the version handshake, builds typed
//! requests, correlates responses by request id and surfaces the
//! filesystem operation set. The transport is out of scope: the embedder
//! hands outbound frames to its channel through [`ChannelSink`] and
//! feeds inbound frames to [`SftpSession::handle_message`].
//!
//! Completion is asynchronous and single threaded: every operation
//! takes a continuation which runs when the matching response is
//! dispatched, in response arrival order. Locally failing operations
//! never complete inside the submitting call, they ride a deferred
//! queue drained by [`SftpSession::progress`] and `handle_message`.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use snafu::prelude::*;

use crate::attrs::Attrs;
use crate::config::Limits;
use crate::error::{self, CommandInfo};
use crate::extensions::{
    ExtensionMap, Feature, FeatureSet, SSH_EXT_CHECK_FILE_HANDLE,
    SSH_EXT_COPY_DATA, SSH_EXT_FSTATVFS, SSH_EXT_FSYNC, SSH_EXT_HARDLINK,
    SSH_EXT_POSIX_RENAME, SSH_EXT_STATVFS,
};
use crate::flags;
use crate::handle::{FileHandle, SessionId};
use crate::proto::{
    CheckFileReply, Close, DirEntry, Extended, ExtendedReq, Fsetstat, Fstat,
    Lstat, Mkdir, Open, Opendir, Read, Readdir, Readlink, Realpath, Remove,
    Rename, ReqId, Rmdir, Setstat, SftpNum, SftpPacket, Stat, StatVfs, Status,
    StatusCode, Symlink, Write, SFTP_MIN_FRAME_LEN, SFTP_VERSION,
};
use crate::requests::{Pending, RequestMap, ResponseParser};
use crate::sshwire::{
    read_ssh, BinString, DecodeBytes, FrameSink, SSHDecode, SSHEncode, SSHSource,
    TextString,
};

/// The framed byte channel a session is bound to.
///
/// `send` hands one complete frame (length prefix included) to the
/// transport. The channel must deliver `send` acceptance and inbound
/// `handle_message` calls serially with respect to each other.
pub trait ChannelSink {
    fn send(&mut self, frame: &[u8]) -> Result<()>;
}

/// `rename` flag: replace an existing target, via
/// `posix-rename@openssh.com`.
pub const RENAME_OVERWRITE: u32 = 0x1;

/// Digest of a byte range of an open file, from `check-file-handle`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHash {
    /// The algorithm the server picked from the requested list
    pub algorithm: String,
    pub hash: Vec<u8>,
}

pub type ReadyCb = Box<dyn FnOnce(&mut SftpSession, Result<()>)>;
pub type StatusCb = Box<dyn FnOnce(&mut SftpSession, Result<()>)>;
pub type HandleCb = Box<dyn FnOnce(&mut SftpSession, Result<FileHandle>)>;
pub type DataCb = Box<dyn FnOnce(&mut SftpSession, Result<Vec<u8>>)>;
pub type AttrsCb = Box<dyn FnOnce(&mut SftpSession, Result<Attrs>)>;
pub type DirCb = Box<dyn FnOnce(&mut SftpSession, Result<Option<Vec<DirEntry>>>)>;
pub type PathCb = Box<dyn FnOnce(&mut SftpSession, Result<String>)>;
pub type StatVfsCb = Box<dyn FnOnce(&mut SftpSession, Result<StatVfs>)>;
pub type HashCb = Box<dyn FnOnce(&mut SftpSession, Result<FileHash>)>;

type DeferredFn = Box<dyn FnOnce(&mut SftpSession)>;

#[derive(Debug, Default, PartialEq, Eq)]
enum SessionState {
    /// Not yet bound to a channel
    #[default]
    Detached,
    /// `SSH_FXP_INIT` sent, waiting for `SSH_FXP_VERSION`
    AwaitVersion,
    Ready,
    Closed,
}

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// An SFTP v3 client session over an externally supplied channel.
pub struct SftpSession {
    state: SessionState,
    channel: Option<Box<dyn ChannelSink>>,
    limits: Limits,
    id: SessionId,
    requests: RequestMap,
    extensions: ExtensionMap,
    features: FeatureSet,
    bytes_sent: u64,
    bytes_received: u64,
    deferred: VecDeque<DeferredFn>,
    on_ready: Option<ReadyCb>,
}

impl Default for SftpSession {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

impl SftpSession {
    pub fn new(limits: Limits) -> Self {
        SftpSession {
            state: SessionState::default(),
            channel: None,
            limits,
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            requests: RequestMap::new(),
            extensions: ExtensionMap::new(),
            features: FeatureSet::default(),
            bytes_sent: 0,
            bytes_received: 0,
            deferred: VecDeque::new(),
            on_ready: None,
        }
    }

    /// Binds the session to its channel and starts the version
    /// handshake. `on_ready` runs once the server's `SSH_FXP_VERSION`
    /// has been accepted, or with the error that ended the handshake.
    ///
    /// A session binds once; rebinding is refused.
    pub fn bind(
        &mut self,
        channel: Box<dyn ChannelSink>,
        on_ready: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        if self.state != SessionState::Detached {
            return error::BadUsage { what: "session is already bound" }.fail();
        }
        self.channel = Some(channel);
        self.on_ready = Some(Box::new(on_ready));

        // The handshake packet carries the version where other packets
        // carry a request id; it occupies bookkeeping id 1.
        let mut buf = [0u8; 16];
        let mut sink = FrameSink::new(&mut buf);
        SftpNum::SSH_FXP_INIT.enc(&mut sink)?;
        SFTP_VERSION.enc(&mut sink)?;
        let frame = sink.finalize();
        debug!("sending INIT version {SFTP_VERSION}");
        self.send_frame_raw(frame)?;
        self.state = SessionState::AwaitVersion;
        Ok(())
    }

    /// Feed one inbound frame (length prefix included) from the channel.
    ///
    /// An `Err` return is fatal: the session has torn down and every
    /// parked continuation has been failed.
    pub fn handle_message(&mut self, frame: &[u8]) -> Result<()> {
        self.progress();

        self.bytes_received += frame.len() as u64;
        if frame.len() < SFTP_MIN_FRAME_LEN {
            return self.session_violation(Error::RanOut);
        }
        let declared =
            u32::from_be_bytes(frame[..4].try_into().trap()?) as usize;
        if declared + 4 != frame.len() {
            warn!(
                "frame length prefix {declared} disagrees with frame of {}",
                frame.len()
            );
            return self.session_violation(Error::SSHProtoError);
        }
        let body = &frame[4..];

        match self.state {
            SessionState::Detached | SessionState::Closed => {
                Err(Error::NoConnection)
            }
            SessionState::AwaitVersion => self.handle_version(body),
            SessionState::Ready => self.dispatch(body),
        }
    }

    /// The channel closed underneath the session. Every parked
    /// continuation fails with `SSH_FX_CONNECTION_LOST`.
    pub fn handle_close(&mut self, reason: Option<&Error>) {
        if let Some(e) = reason {
            warn!("channel closed: {e}");
        } else {
            debug!("channel closed");
        }
        self.teardown();
    }

    /// Ends the session: detaches the channel and fails every parked
    /// continuation with `SSH_FX_CONNECTION_LOST`. Further submits fail
    /// with `SSH_FX_NO_CONNECTION`.
    pub fn end(&mut self) {
        if self.state != SessionState::Closed {
            debug!("session end, {} requests in flight", self.requests.len());
            self.teardown();
        }
    }

    /// Runs completions queued by locally failing operations.
    ///
    /// Call from the embedder's event loop; `handle_message` also drains
    /// the queue, so a pure inbound pump observes them too.
    pub fn progress(&mut self) {
        while let Some(f) = self.deferred.pop_front() {
            f(self);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Extensions the server advertised at handshake
    pub fn extensions(&self) -> &ExtensionMap {
        &self.extensions
    }

    /// Capabilities derived from the advertised extensions
    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Requests currently awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    // Engine internals

    fn send_frame_raw(&mut self, frame: &[u8]) -> Result<()> {
        let ch = self.channel.as_mut().ok_or(Error::NoConnection)?;
        ch.send(frame)?;
        self.bytes_sent += frame.len() as u64;
        Ok(())
    }

    fn defer(&mut self, f: impl FnOnce(&mut SftpSession) + 'static) {
        self.deferred.push_back(Box::new(f));
    }

    /// Protocol violation: tear down and report.
    fn session_violation(&mut self, e: Error) -> Result<()> {
        error!("protocol violation: {e}");
        self.teardown();
        Err(e)
    }

    fn teardown(&mut self) {
        self.state = SessionState::Closed;
        self.channel = None;
        if let Some(cb) = self.on_ready.take() {
            let info = CommandInfo { command: "init", ..Default::default() };
            cb(self, Err(Error::connection_lost(&info)));
        }
        for p in self.requests.drain() {
            let Pending { parser, info } = p;
            let err = Error::connection_lost(&info);
            parser(self, Err(err), &info);
        }
    }

    fn handle_version(&mut self, body: &[u8]) -> Result<()> {
        let mut s = DecodeBytes::new(body);
        let num = match SftpNum::dec(&mut s) {
            Ok(n) => n,
            Err(e) => return self.fail_handshake(e.into()),
        };
        if num != SftpNum::SSH_FXP_VERSION {
            warn!("expected VERSION, got {num:?}");
            return self.fail_handshake(Error::PacketWrong);
        }
        let version = match u32::dec(&mut s) {
            Ok(v) => v,
            Err(e) => return self.fail_handshake(e.into()),
        };
        if version != SFTP_VERSION {
            return self.fail_handshake(Error::BadVersion { version });
        }

        // (name, data) pairs to end of frame
        let mut ext = ExtensionMap::new();
        while s.remaining() > 0 {
            let (name, data) =
                match (BinString::dec(&mut s), BinString::dec(&mut s)) {
                    (Ok(n), Ok(d)) => (n, d),
                    _ => return self.fail_handshake(Error::RanOut),
                };
            match core::str::from_utf8(name.0) {
                Ok(name) => {
                    trace!("extension {name}");
                    ext.insert(name, data.0);
                }
                Err(_) => warn!("skipping extension with non UTF-8 name"),
            }
        }
        self.features = FeatureSet::from_extensions(&ext);
        self.extensions = ext;
        self.state = SessionState::Ready;
        info!("session ready, {} extensions", self.extensions.len());
        if let Some(cb) = self.on_ready.take() {
            cb(self, Ok(()));
        }
        Ok(())
    }

    /// Handshake failure is fatal and also reaches the bind callback.
    fn fail_handshake(&mut self, e: Error) -> Result<()> {
        error!("handshake failed: {e}");
        let cb = self.on_ready.take();
        self.teardown();
        if let Some(cb) = cb {
            let err = match &e {
                Error::BadVersion { version } =>
                    Error::BadVersion { version: *version },
                _ => Error::PacketWrong,
            };
            cb(self, Err(err));
        }
        Err(e)
    }

    fn dispatch(&mut self, body: &[u8]) -> Result<()> {
        let mut s = DecodeBytes::new(body);
        let (id, packet) = match SftpPacket::decode_response(&mut s) {
            Ok(v) => v,
            Err(e) => return self.session_violation(e.into()),
        };
        trace!("response {:?} for id {}", packet.sftp_num(), id.0);
        let Pending { parser, info } = match self.requests.claim(id.0) {
            Some(p) => p,
            None => {
                warn!("response for unknown request id {}", id.0);
                return self.session_violation(Error::SSHProtoError);
            }
        };
        parser(self, Ok(packet), &info);
        Ok(())
    }

    /// Submits one request: assigns an id, serializes the frame, parks
    /// the continuation and hands the bytes to the channel. Failures
    /// complete through the continuation on a deferred tick, never
    /// inside this call.
    fn submit(
        &mut self,
        packet: SftpPacket<'_>,
        info: CommandInfo,
        parser: ResponseParser,
    ) {
        if self.channel.is_none() || self.state != SessionState::Ready {
            let err = Error::no_connection(&info);
            self.defer(move |sess| parser(sess, Err(err), &info));
            return;
        }

        let id = self.requests.next_id();
        let mut buf = vec![0u8; self.limits.max_packet()];
        let mut sink = FrameSink::new(&mut buf);
        if let Err(e) = packet.encode_request(ReqId(id), &mut sink) {
            // buffers are sized for any valid request
            let err: Error = e.into();
            self.defer(move |sess| parser(sess, Err(err), &info));
            return;
        }
        let frame = sink.finalize();

        if let Err(p) = self.requests.park(id, Pending { parser, info }) {
            // duplicate in-flight id: a programming error, abort
            let err = Error::bug();
            self.teardown();
            let Pending { parser, info } = p;
            self.defer(move |sess| parser(sess, Err(err), &info));
            return;
        }

        trace!("request {:?} id {}", packet.sftp_num(), id);
        if let Err(e) = self.send_frame_raw(frame) {
            warn!("channel send failed: {e}");
            // reclaim before teardown so the continuation fires once
            let p = self.requests.claim(id);
            self.teardown();
            if let Some(Pending { parser, info }) = p {
                self.defer(move |sess| parser(sess, Err(e), &info));
            }
        }
    }

    fn feature_missing(&self, f: Feature, info: &CommandInfo) -> Option<Error> {
        if self.features.has(f) {
            None
        } else {
            debug!("{} requires an extension the server lacks", info.command);
            Some(Error::unsupported(info))
        }
    }

    // Operations

    /// Opens a file. `mode` is a symbolic open mode from
    /// [`flags`](crate::flags), e.g. `"r"` or `"w+"`.
    pub fn open(
        &mut self,
        path: &str,
        mode: &str,
        attrs: Option<Attrs>,
        cb: impl FnOnce(&mut SftpSession, Result<FileHandle>) + 'static,
    ) -> Result<()> {
        let pflags = flags::to_flags(mode)
            .ok_or(Error::BadUsage { what: "unrecognized open mode" })?;
        self.open_flags(path, pflags, attrs, cb)
    }

    /// Opens a file with explicit `SSH_FXF_*` bits.
    pub fn open_flags(
        &mut self,
        path: &str,
        pflags: u32,
        attrs: Option<Attrs>,
        cb: impl FnOnce(&mut SftpSession, Result<FileHandle>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::path("open", path);
        let path = untilde(path);
        let p = Open {
            filename: TextString(path.as_bytes()),
            pflags: pflags & flags::SSH_FXF_ALL,
            attrs: attrs.unwrap_or_default(),
        };
        self.submit(p.into(), info, handle_parser(Box::new(cb)));
        Ok(())
    }

    pub fn close(
        &mut self,
        handle: &FileHandle,
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::handle("close", handle.as_bytes());
        let h = handle.owned_bytes(self.id, &info)?;
        let p = Close { handle: BinString(h) };
        self.submit(p.into(), info, status_parser(Box::new(cb)));
        Ok(())
    }

    /// Reads up to `len` bytes at `offset`.
    ///
    /// A zero length buffer means end of file. `len` is clamped to
    /// [`Limits::max_read_block`]. Servers occasionally answer with
    /// zero-byte DATA; those reads are re-issued up to
    /// [`Limits::empty_read_retries`] times before `EIO` surfaces.
    pub fn read(
        &mut self,
        handle: &FileHandle,
        offset: u64,
        len: u32,
        cb: impl FnOnce(&mut SftpSession, Result<Vec<u8>>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::handle("read", handle.as_bytes());
        handle.owned_bytes(self.id, &info)?;
        let len = len.min(self.limits.max_read_block);
        let retries = self.limits.empty_read_retries;
        self.read_inner(handle.clone(), offset, len, retries, Box::new(cb));
        Ok(())
    }

    fn read_inner(
        &mut self,
        handle: FileHandle,
        offset: u64,
        len: u32,
        retries_left: u32,
        cb: DataCb,
    ) {
        let info = CommandInfo::handle("read", handle.as_bytes());
        let retry_handle = handle.clone();
        let parser = mk_parser(move |sess, resp, info| match resp {
            Err(e) => cb(sess, Err(e)),
            Ok(SftpPacket::Data(d)) => {
                let data = d.data.0;
                if !data.is_empty() {
                    cb(sess, Ok(data.to_vec()));
                } else if retries_left > 0 {
                    debug!("zero length read, {retries_left} retries left");
                    sess.read_inner(
                        retry_handle,
                        offset,
                        len,
                        retries_left - 1,
                        cb,
                    );
                } else {
                    cb(
                        sess,
                        Err(Error::EmptyReadLimit { info: info.clone() }),
                    );
                }
            }
            Ok(SftpPacket::Status(st))
                if st.code == StatusCode::SSH_FX_EOF =>
            {
                cb(sess, Ok(Vec::new()))
            }
            Ok(SftpPacket::Status(st)) => {
                cb(sess, Err(status_failure(&st, info)))
            }
            Ok(_) => {
                let e = unexpected_reply(sess, info);
                cb(sess, Err(e));
            }
        });
        let p = Read { handle: BinString(handle.as_bytes()), offset, len };
        self.submit(p.into(), info, parser);
    }

    /// Writes `data` at `offset`. Lengths above
    /// [`Limits::max_write_block`] are refused here, callers split large
    /// writes.
    pub fn write(
        &mut self,
        handle: &FileHandle,
        offset: u64,
        data: &[u8],
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::handle("write", handle.as_bytes());
        let h = handle.owned_bytes(self.id, &info)?;
        if data.len() > self.limits.max_write_block as usize {
            return error::BadUsage {
                what: "write exceeds the maximum write block",
            }
            .fail();
        }
        let p = Write { handle: BinString(h), offset, data: BinString(data) };
        self.submit(p.into(), info, status_parser(Box::new(cb)));
        Ok(())
    }

    pub fn lstat(
        &mut self,
        path: &str,
        cb: impl FnOnce(&mut SftpSession, Result<Attrs>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::path("lstat", path);
        let path = untilde(path);
        let p = Lstat { path: TextString(path.as_bytes()) };
        self.submit(p.into(), info, attrs_parser(Box::new(cb)));
        Ok(())
    }

    pub fn stat(
        &mut self,
        path: &str,
        cb: impl FnOnce(&mut SftpSession, Result<Attrs>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::path("stat", path);
        let path = untilde(path);
        let p = Stat { path: TextString(path.as_bytes()) };
        self.submit(p.into(), info, attrs_parser(Box::new(cb)));
        Ok(())
    }

    pub fn fstat(
        &mut self,
        handle: &FileHandle,
        cb: impl FnOnce(&mut SftpSession, Result<Attrs>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::handle("fstat", handle.as_bytes());
        let h = handle.owned_bytes(self.id, &info)?;
        let p = Fstat { handle: BinString(h) };
        self.submit(p.into(), info, attrs_parser(Box::new(cb)));
        Ok(())
    }

    pub fn setstat(
        &mut self,
        path: &str,
        attrs: Attrs,
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::path("setstat", path);
        let path = untilde(path);
        let p = Setstat { path: TextString(path.as_bytes()), attrs };
        self.submit(p.into(), info, status_parser(Box::new(cb)));
        Ok(())
    }

    pub fn fsetstat(
        &mut self,
        handle: &FileHandle,
        attrs: Attrs,
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::handle("fsetstat", handle.as_bytes());
        let h = handle.owned_bytes(self.id, &info)?;
        let p = Fsetstat { handle: BinString(h), attrs };
        self.submit(p.into(), info, status_parser(Box::new(cb)));
        Ok(())
    }

    pub fn opendir(
        &mut self,
        path: &str,
        cb: impl FnOnce(&mut SftpSession, Result<FileHandle>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::path("opendir", path);
        let path = untilde(path);
        let p = Opendir { path: TextString(path.as_bytes()) };
        self.submit(p.into(), info, handle_parser(Box::new(cb)));
        Ok(())
    }

    /// Reads the next batch of directory entries. Completion with `None`
    /// signals the end of the enumeration.
    pub fn readdir(
        &mut self,
        handle: &FileHandle,
        cb: impl FnOnce(&mut SftpSession, Result<Option<Vec<DirEntry>>>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::handle("readdir", handle.as_bytes());
        let h = handle.owned_bytes(self.id, &info)?;
        let p = Readdir { handle: BinString(h) };
        self.submit(p.into(), info, dir_parser(Box::new(cb)));
        Ok(())
    }

    pub fn mkdir(
        &mut self,
        path: &str,
        attrs: Option<Attrs>,
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::path("mkdir", path);
        let path = untilde(path);
        let p = Mkdir {
            path: TextString(path.as_bytes()),
            attrs: attrs.unwrap_or_default(),
        };
        self.submit(p.into(), info, status_parser(Box::new(cb)));
        Ok(())
    }

    pub fn rmdir(
        &mut self,
        path: &str,
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::path("rmdir", path);
        let path = untilde(path);
        let p = Rmdir { path: TextString(path.as_bytes()) };
        self.submit(p.into(), info, status_parser(Box::new(cb)));
        Ok(())
    }

    /// Removes a file
    pub fn remove(
        &mut self,
        path: &str,
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::path("remove", path);
        let path = untilde(path);
        let p = Remove { path: TextString(path.as_bytes()) };
        self.submit(p.into(), info, status_parser(Box::new(cb)));
        Ok(())
    }

    pub fn realpath(
        &mut self,
        path: &str,
        cb: impl FnOnce(&mut SftpSession, Result<String>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::path("realpath", path);
        let path = untilde(path);
        let p = Realpath { path: TextString(path.as_bytes()) };
        self.submit(p.into(), info, single_name_parser(Box::new(cb)));
        Ok(())
    }

    pub fn readlink(
        &mut self,
        path: &str,
        cb: impl FnOnce(&mut SftpSession, Result<String>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::path("readlink", path);
        let path = untilde(path);
        let p = Readlink { path: TextString(path.as_bytes()) };
        self.submit(p.into(), info, single_name_parser(Box::new(cb)));
        Ok(())
    }

    /// Creates a symlink at `linkpath` pointing at `targetpath`.
    pub fn symlink(
        &mut self,
        targetpath: &str,
        linkpath: &str,
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::two_paths("symlink", targetpath, linkpath);
        let target = untilde(targetpath);
        let link = untilde(linkpath);
        let p = Symlink {
            targetpath: TextString(target.as_bytes()),
            linkpath: TextString(link.as_bytes()),
        };
        self.submit(p.into(), info, status_parser(Box::new(cb)));
        Ok(())
    }

    /// Renames `oldpath` to `newpath`.
    ///
    /// With no flags this is plain `SSH_FXP_RENAME`, which fails if the
    /// target exists. [`RENAME_OVERWRITE`] switches to
    /// `posix-rename@openssh.com` and requires the server to advertise
    /// it. Any other flag completes with `SSH_FX_OP_UNSUPPORTED`; no
    /// bytes are sent.
    pub fn rename(
        &mut self,
        oldpath: &str,
        newpath: &str,
        rflags: u32,
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::two_paths("rename", oldpath, newpath);
        let old = untilde(oldpath);
        let new = untilde(newpath);
        let cb: StatusCb = Box::new(cb);
        match rflags {
            0 => {
                let p = Rename {
                    oldpath: TextString(old.as_bytes()),
                    newpath: TextString(new.as_bytes()),
                };
                self.submit(p.into(), info, status_parser(cb));
            }
            RENAME_OVERWRITE => {
                if let Some(err) =
                    self.feature_missing(Feature::PosixRename, &info)
                {
                    self.defer(move |sess| cb(sess, Err(err)));
                    return Ok(());
                }
                let p = Extended {
                    name: SSH_EXT_POSIX_RENAME,
                    req: ExtendedReq::PosixRename {
                        oldpath: TextString(old.as_bytes()),
                        newpath: TextString(new.as_bytes()),
                    },
                };
                self.submit(p.into(), info, status_parser(cb));
            }
            other => {
                debug!("unsupported rename flags {other:#x}");
                let err = Error::unsupported(&info);
                self.defer(move |sess| cb(sess, Err(err)));
            }
        }
        Ok(())
    }

    /// Creates a hard link, via `hardlink@openssh.com`.
    pub fn link(
        &mut self,
        oldpath: &str,
        newpath: &str,
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::two_paths("link", oldpath, newpath);
        let cb: StatusCb = Box::new(cb);
        if let Some(err) = self.feature_missing(Feature::Hardlink, &info) {
            self.defer(move |sess| cb(sess, Err(err)));
            return Ok(());
        }
        let old = untilde(oldpath);
        let new = untilde(newpath);
        let p = Extended {
            name: SSH_EXT_HARDLINK,
            req: ExtendedReq::Hardlink {
                oldpath: TextString(old.as_bytes()),
                newpath: TextString(new.as_bytes()),
            },
        };
        self.submit(p.into(), info, status_parser(cb));
        Ok(())
    }

    /// Server side byte-range copy between two open handles, via
    /// `copy-data`.
    pub fn copy_data(
        &mut self,
        read_handle: &FileHandle,
        read_offset: u64,
        length: u64,
        write_handle: &FileHandle,
        write_offset: u64,
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::handle("copy-data", read_handle.as_bytes());
        let rh = read_handle.owned_bytes(self.id, &info)?;
        let wh = write_handle.owned_bytes(self.id, &info)?;
        let cb: StatusCb = Box::new(cb);
        if let Some(err) = self.feature_missing(Feature::CopyData, &info) {
            self.defer(move |sess| cb(sess, Err(err)));
            return Ok(());
        }
        let p = Extended {
            name: SSH_EXT_COPY_DATA,
            req: ExtendedReq::CopyData {
                read_handle: BinString(rh),
                read_offset,
                read_length: length,
                write_handle: BinString(wh),
                write_offset,
            },
        };
        self.submit(p.into(), info, status_parser(cb));
        Ok(())
    }

    /// Asks the server to hash a byte range of an open file, via
    /// `check-file-handle`. `algorithms` is a comma separated preference
    /// list such as `"sha256,md5"`.
    pub fn check_file_handle(
        &mut self,
        handle: &FileHandle,
        algorithms: &str,
        start_offset: u64,
        length: u64,
        block_size: u32,
        cb: impl FnOnce(&mut SftpSession, Result<FileHash>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::handle("check-file", handle.as_bytes());
        let h = handle.owned_bytes(self.id, &info)?;
        let cb: HashCb = Box::new(cb);
        if let Some(err) = self.feature_missing(Feature::CheckFileHandle, &info)
        {
            self.defer(move |sess| cb(sess, Err(err)));
            return Ok(());
        }
        let p = Extended {
            name: SSH_EXT_CHECK_FILE_HANDLE,
            req: ExtendedReq::CheckFileHandle {
                handle: BinString(h),
                algorithms,
                start_offset,
                length,
                block_size,
            },
        };
        self.submit(p.into(), info, check_file_parser(cb));
        Ok(())
    }

    /// Filesystem statistics for the filesystem holding `path`, via
    /// `statvfs@openssh.com`.
    pub fn statvfs(
        &mut self,
        path: &str,
        cb: impl FnOnce(&mut SftpSession, Result<StatVfs>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::path("statvfs", path);
        let cb: StatVfsCb = Box::new(cb);
        if let Some(err) = self.feature_missing(Feature::Statvfs, &info) {
            self.defer(move |sess| cb(sess, Err(err)));
            return Ok(());
        }
        let path = untilde(path);
        let p = Extended {
            name: SSH_EXT_STATVFS,
            req: ExtendedReq::Statvfs { path: TextString(path.as_bytes()) },
        };
        self.submit(p.into(), info, statvfs_parser(cb));
        Ok(())
    }

    /// Filesystem statistics for an open handle, via
    /// `fstatvfs@openssh.com`.
    pub fn fstatvfs(
        &mut self,
        handle: &FileHandle,
        cb: impl FnOnce(&mut SftpSession, Result<StatVfs>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::handle("fstatvfs", handle.as_bytes());
        let h = handle.owned_bytes(self.id, &info)?;
        let cb: StatVfsCb = Box::new(cb);
        if let Some(err) = self.feature_missing(Feature::Fstatvfs, &info) {
            self.defer(move |sess| cb(sess, Err(err)));
            return Ok(());
        }
        let p = Extended {
            name: SSH_EXT_FSTATVFS,
            req: ExtendedReq::Fstatvfs { handle: BinString(h) },
        };
        self.submit(p.into(), info, statvfs_parser(cb));
        Ok(())
    }

    /// Flushes server side buffers of an open file, via
    /// `fsync@openssh.com`.
    pub fn fsync(
        &mut self,
        handle: &FileHandle,
        cb: impl FnOnce(&mut SftpSession, Result<()>) + 'static,
    ) -> Result<()> {
        let info = CommandInfo::handle("fsync", handle.as_bytes());
        let h = handle.owned_bytes(self.id, &info)?;
        let cb: StatusCb = Box::new(cb);
        if let Some(err) = self.feature_missing(Feature::Fsync, &info) {
            self.defer(move |sess| cb(sess, Err(err)));
            return Ok(());
        }
        let p = Extended {
            name: SSH_EXT_FSYNC,
            req: ExtendedReq::Fsync { handle: BinString(h) },
        };
        self.submit(p.into(), info, status_parser(cb));
        Ok(())
    }
}

/// `~` and `~/x` become `.` and `./x`; expansion proper is the server's
/// job.
fn untilde(path: &str) -> Cow<'_, str> {
    if path == "~" {
        Cow::Borrowed(".")
    } else if let Some(rest) = path.strip_prefix("~/") {
        Cow::Owned(format!("./{rest}"))
    } else {
        Cow::Borrowed(path)
    }
}

fn mk_parser<F>(f: F) -> ResponseParser
where
    F: for<'p> FnOnce(&mut SftpSession, Result<SftpPacket<'p>>, &CommandInfo)
        + 'static,
{
    Box::new(f)
}

/// A reply of an entirely wrong type is fatal for the session.
fn unexpected_reply(sess: &mut SftpSession, info: &CommandInfo) -> Error {
    error!("unexpected response type for {info}");
    sess.teardown();
    Error::PacketWrong
}

fn status_failure(st: &Status<'_>, info: &CommandInfo) -> Error {
    let message = String::from_utf8_lossy(st.message.0).into_owned();
    Error::Status { code: st.code, message, info: info.clone() }
}

fn status_result(st: &Status<'_>, info: &CommandInfo) -> Result<()> {
    if st.code == StatusCode::SSH_FX_OK {
        Ok(())
    } else {
        Err(status_failure(st, info))
    }
}

fn status_parser(cb: StatusCb) -> ResponseParser {
    mk_parser(move |sess, resp, info| {
        let r = match resp {
            Err(e) => Err(e),
            Ok(SftpPacket::Status(st)) => status_result(&st, info),
            Ok(_) => Err(unexpected_reply(sess, info)),
        };
        cb(sess, r)
    })
}

fn handle_parser(cb: HandleCb) -> ResponseParser {
    mk_parser(move |sess, resp, info| {
        let r = match resp {
            Err(e) => Err(e),
            Ok(SftpPacket::Handle(h)) => {
                Ok(FileHandle::new(h.handle.0.to_vec(), sess.id))
            }
            Ok(SftpPacket::Status(st)) => Err(status_failure(&st, info)),
            Ok(_) => Err(unexpected_reply(sess, info)),
        };
        cb(sess, r)
    })
}

fn attrs_parser(cb: AttrsCb) -> ResponseParser {
    mk_parser(move |sess, resp, info| {
        let r = match resp {
            Err(e) => Err(e),
            Ok(SftpPacket::Attrs(a)) => Ok(a.attrs),
            Ok(SftpPacket::Status(st)) => Err(status_failure(&st, info)),
            Ok(_) => Err(unexpected_reply(sess, info)),
        };
        cb(sess, r)
    })
}

fn dir_parser(cb: DirCb) -> ResponseParser {
    mk_parser(move |sess, resp, info| {
        let r = match resp {
            Err(e) => Err(e),
            Ok(SftpPacket::Name(name)) => {
                let mut out = Vec::with_capacity(name.0.len());
                let mut err = None;
                for e in name.0.iter() {
                    match DirEntry::try_from(e) {
                        Ok(d) => out.push(d),
                        Err(we) => {
                            err = Some(we.into());
                            break;
                        }
                    }
                }
                match err {
                    None => Ok(Some(out)),
                    Some(e) => Err(e),
                }
            }
            Ok(SftpPacket::Status(st))
                if st.code == StatusCode::SSH_FX_EOF =>
            {
                // end of the enumeration
                Ok(None)
            }
            Ok(SftpPacket::Status(st)) => Err(status_failure(&st, info)),
            Ok(_) => Err(unexpected_reply(sess, info)),
        };
        cb(sess, r)
    })
}

/// realpath and readlink answer with exactly one name entry.
fn single_name_parser(cb: PathCb) -> ResponseParser {
    mk_parser(move |sess, resp, info| {
        let r = match resp {
            Err(e) => Err(e),
            Ok(SftpPacket::Name(name)) => {
                if name.0.len() == 1 {
                    match name.0[0].filename.as_str() {
                        Ok(p) => Ok(p.to_string()),
                        Err(we) => Err(we.into()),
                    }
                } else {
                    Err(unexpected_reply(sess, info))
                }
            }
            Ok(SftpPacket::Status(st)) => Err(status_failure(&st, info)),
            Ok(_) => Err(unexpected_reply(sess, info)),
        };
        cb(sess, r)
    })
}

fn statvfs_parser(cb: StatVfsCb) -> ResponseParser {
    mk_parser(move |sess, resp, info| {
        let r = match resp {
            Err(e) => Err(e),
            Ok(SftpPacket::ExtendedReply(rep)) => read_ssh::<StatVfs>(rep.data),
            Ok(SftpPacket::Status(st)) => Err(status_failure(&st, info)),
            Ok(_) => Err(unexpected_reply(sess, info)),
        };
        cb(sess, r)
    })
}

fn check_file_parser(cb: HashCb) -> ResponseParser {
    mk_parser(move |sess, resp, info| {
        let r = match resp {
            Err(e) => Err(e),
            Ok(SftpPacket::ExtendedReply(rep)) => {
                read_ssh::<CheckFileReply>(rep.data).map(|cf| FileHash {
                    algorithm: cf.algorithm.to_string(),
                    hash: cf.hash.to_vec(),
                })
            }
            Ok(SftpPacket::Status(st)) => Err(status_failure(&st, info)),
            Ok(_) => Err(unexpected_reply(sess, info)),
        };
        cb(sess, r)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowtidelog::init_test_log;
    use crate::proto::{AttrsReply, Data, ExtendedReply, Handle, Name, NameEntry};
    use crate::sshwire::write_ssh;
    use std::cell::RefCell;
    use std::rc::Rc;

    type SentFrames = Rc<RefCell<Vec<Vec<u8>>>>;

    struct MockChannel(SentFrames);

    impl ChannelSink for MockChannel {
        fn send(&mut self, frame: &[u8]) -> Result<()> {
            self.0.borrow_mut().push(frame.to_vec());
            Ok(())
        }
    }

    /// A channel that refuses every send.
    struct DeadChannel;

    impl ChannelSink for DeadChannel {
        fn send(&mut self, _frame: &[u8]) -> Result<()> {
            Err(Error::NoConnection)
        }
    }

    fn version_frame(exts: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let mut sink = FrameSink::new(&mut buf);
        SftpNum::SSH_FXP_VERSION.enc(&mut sink).unwrap();
        SFTP_VERSION.enc(&mut sink).unwrap();
        for (n, d) in exts {
            (*n).enc(&mut sink).unwrap();
            BinString(*d).enc(&mut sink).unwrap();
        }
        sink.finalize().to_vec()
    }

    fn reply(id: u32, p: &SftpPacket<'_>) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let mut sink = FrameSink::new(&mut buf);
        p.encode_response(ReqId(id), &mut sink).unwrap();
        sink.finalize().to_vec()
    }

    fn ok_status() -> SftpPacket<'static> {
        Status {
            code: StatusCode::SSH_FX_OK,
            message: "".into(),
            lang: "".into(),
        }
        .into()
    }

    fn status_of(code: StatusCode) -> SftpPacket<'static> {
        Status { code, message: "test".into(), lang: "".into() }.into()
    }

    fn capture<T: 'static>(
    ) -> (Rc<RefCell<Option<Result<T>>>>, impl FnOnce(&mut SftpSession, Result<T>))
    {
        let slot: Rc<RefCell<Option<Result<T>>>> = Rc::new(RefCell::new(None));
        let inner = slot.clone();
        (slot, move |_s: &mut SftpSession, r: Result<T>| {
            let prev = inner.borrow_mut().replace(r);
            assert!(prev.is_none(), "continuation ran twice");
        })
    }

    fn ready_session_with(
        exts: &[(&str, &[u8])],
    ) -> (SftpSession, SentFrames) {
        init_test_log();
        let frames: SentFrames = Rc::default();
        let mut sess = SftpSession::default();
        sess.bind(
            Box::new(MockChannel(frames.clone())),
            |_s, r| assert!(r.is_ok()),
        )
        .unwrap();
        sess.handle_message(&version_frame(exts)).unwrap();
        assert!(sess.is_ready());
        (sess, frames)
    }

    fn ready_session() -> (SftpSession, SentFrames) {
        ready_session_with(&[])
    }

    fn srv_handle(sess: &SftpSession, bytes: &[u8]) -> FileHandle {
        FileHandle::new(bytes.to_vec(), sess.id)
    }

    #[test]
    fn init_frame_bytes() {
        init_test_log();
        let frames: SentFrames = Rc::default();
        let mut sess = SftpSession::default();
        sess.bind(Box::new(MockChannel(frames.clone())), |_s, _r| {}).unwrap();
        assert_eq!(
            frames.borrow()[0],
            vec![0, 0, 0, 5, 1, 0, 0, 0, 3],
        );
        assert_eq!(sess.bytes_sent(), 9);
        assert!(!sess.is_ready());
    }

    #[test]
    fn handshake_sets_features() {
        let (sess, _frames) = ready_session_with(&[
            (SSH_EXT_POSIX_RENAME, b"1" as &[u8]),
            ("vendor-thing@example.com", b"x"),
        ]);
        assert!(sess.features().has(Feature::PosixRename));
        assert!(!sess.features().has(Feature::Hardlink));
        assert_eq!(sess.extensions().len(), 2);
    }

    #[test]
    fn handshake_rejects_wrong_packet() {
        init_test_log();
        let frames: SentFrames = Rc::default();
        let mut sess = SftpSession::default();
        let (slot, cb) = capture::<()>();
        sess.bind(Box::new(MockChannel(frames)), cb).unwrap();
        let e = sess
            .handle_message(&reply(7, &ok_status()))
            .unwrap_err();
        assert!(matches!(e, Error::PacketWrong));
        assert!(slot.borrow().as_ref().unwrap().is_err());
        assert!(!sess.is_ready());
    }

    #[test]
    fn handshake_rejects_version_mismatch() {
        init_test_log();
        let frames: SentFrames = Rc::default();
        let mut sess = SftpSession::default();
        let (slot, cb) = capture::<()>();
        sess.bind(Box::new(MockChannel(frames)), cb).unwrap();
        let mut vframe = version_frame(&[]);
        vframe[8] = 4; // server claims version 4
        let e = sess.handle_message(&vframe).unwrap_err();
        assert!(matches!(e, Error::BadVersion { version: 4 }));
        assert!(matches!(
            slot.borrow().as_ref().unwrap(),
            Err(Error::BadVersion { version: 4 })
        ));
    }

    #[test]
    fn rebind_refused() {
        let (mut sess, _frames) = ready_session();
        let other: SentFrames = Rc::default();
        let e = sess
            .bind(Box::new(MockChannel(other)), |_s, _r| {})
            .unwrap_err();
        assert!(matches!(e, Error::BadUsage { .. }));
    }

    #[test]
    fn open_then_close() {
        let (mut sess, frames) = ready_session();

        let (opened, ocb) = capture::<FileHandle>();
        sess.open("/a", "r", None, ocb).unwrap();
        assert_eq!(
            frames.borrow()[1],
            vec![
                0, 0, 0, 19, 3, 0, 0, 0, 2, 0, 0, 0, 2, b'/', b'a', 0, 0, 0, 1,
                0, 0, 0, 0,
            ],
        );
        sess.handle_message(&reply(
            2,
            &Handle { handle: BinString(&[0xab]) }.into(),
        ))
        .unwrap();
        let h = opened.borrow_mut().take().unwrap().unwrap();
        assert_eq!(h.as_bytes(), &[0xab]);

        let (closed, ccb) = capture::<()>();
        sess.close(&h, ccb).unwrap();
        assert_eq!(
            frames.borrow()[2],
            vec![0, 0, 0, 10, 4, 0, 0, 0, 3, 0, 0, 0, 1, 0xab],
        );
        sess.handle_message(&reply(3, &ok_status())).unwrap();
        assert!(closed.borrow_mut().take().unwrap().is_ok());
        assert_eq!(sess.pending_requests(), 0);
    }

    #[test]
    fn open_failure_maps_status() {
        let (mut sess, _frames) = ready_session();
        let (slot, cb) = capture::<FileHandle>();
        sess.open("/missing", "r", None, cb).unwrap();
        sess.handle_message(&reply(
            2,
            &status_of(StatusCode::SSH_FX_NO_SUCH_FILE),
        ))
        .unwrap();
        let err = slot.borrow_mut().take().unwrap().unwrap_err();
        assert_eq!(err.code(), "ENOENT");
        assert_eq!(err.errno(), 34);
        assert_eq!(err.native_code(), Some(2));
    }

    #[test]
    fn read_eof_is_empty_buffer() {
        let (mut sess, _frames) = ready_session();
        let h = srv_handle(&sess, &[0x01]);
        let (slot, cb) = capture::<Vec<u8>>();
        sess.read(&h, 0, 1024, cb).unwrap();
        sess.handle_message(&reply(2, &status_of(StatusCode::SSH_FX_EOF)))
            .unwrap();
        assert_eq!(slot.borrow_mut().take().unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn read_data_delivered() {
        let (mut sess, _frames) = ready_session();
        let h = srv_handle(&sess, &[0x01]);
        let (slot, cb) = capture::<Vec<u8>>();
        sess.read(&h, 8, 16, cb).unwrap();
        sess.handle_message(&reply(
            2,
            &Data { data: BinString(b"payload") }.into(),
        ))
        .unwrap();
        assert_eq!(slot.borrow_mut().take().unwrap().unwrap(), b"payload");
    }

    #[test]
    fn empty_reads_retry_then_fail() {
        let (mut sess, frames) = ready_session();
        let h = srv_handle(&sess, &[0x01]);
        let (slot, cb) = capture::<Vec<u8>>();
        sess.read(&h, 0, 64, cb).unwrap();

        // default budget is four re-submissions
        for (n, id) in (2u32..=5).enumerate() {
            sess.handle_message(&reply(
                id,
                &Data { data: BinString(b"") }.into(),
            ))
            .unwrap();
            assert!(slot.borrow().is_none(), "completed after {n} retries");
        }
        // five read frames went out: the original and four retries
        let reads = frames
            .borrow()
            .iter()
            .filter(|f| f.get(4) == Some(&5))
            .count();
        assert_eq!(reads, 5);

        sess.handle_message(&reply(6, &Data { data: BinString(b"") }.into()))
            .unwrap();
        let err = slot.borrow_mut().take().unwrap().unwrap_err();
        assert_eq!(err.code(), "EIO");
        assert_eq!(err.errno(), 55);
        assert_eq!(sess.pending_requests(), 0);
    }

    #[test]
    fn empty_read_recovers_mid_retry() {
        let (mut sess, _frames) = ready_session();
        let h = srv_handle(&sess, &[0x01]);
        let (slot, cb) = capture::<Vec<u8>>();
        sess.read(&h, 0, 64, cb).unwrap();
        sess.handle_message(&reply(2, &Data { data: BinString(b"") }.into()))
            .unwrap();
        sess.handle_message(&reply(3, &Data { data: BinString(b"ok") }.into()))
            .unwrap();
        assert_eq!(slot.borrow_mut().take().unwrap().unwrap(), b"ok");
    }

    #[test]
    fn write_too_large_rejected_synchronously() {
        let (mut sess, frames) = ready_session();
        let h = srv_handle(&sess, &[0x01]);
        let data = vec![0u8; sess.limits().max_write_block as usize + 1];
        let e = sess.write(&h, 0, &data, |_s, _r| {}).unwrap_err();
        assert!(matches!(e, Error::BadUsage { .. }));
        // nothing beyond INIT went out
        assert_eq!(frames.borrow().len(), 1);
    }

    #[test]
    fn rename_unknown_flag_fails_deferred() {
        let (mut sess, frames) = ready_session();
        let (slot, cb) = capture::<()>();
        sess.rename("a", "b", 0x4, cb).unwrap();
        // completion is asynchronous
        assert!(slot.borrow().is_none());
        sess.progress();
        let err = slot.borrow_mut().take().unwrap().unwrap_err();
        assert_eq!(err.code(), "ENOSYS");
        assert_eq!(err.errno(), 35);
        assert_eq!(frames.borrow().len(), 1, "no bytes must be sent");
    }

    #[test]
    fn rename_overwrite_needs_server_support() {
        let (mut sess, frames) = ready_session();
        let (slot, cb) = capture::<()>();
        sess.rename("a", "b", RENAME_OVERWRITE, cb).unwrap();
        sess.progress();
        let err = slot.borrow_mut().take().unwrap().unwrap_err();
        assert_eq!(err.errno(), 35);
        assert_eq!(frames.borrow().len(), 1);
    }

    #[test]
    fn rename_overwrite_uses_posix_rename() {
        let (mut sess, frames) =
            ready_session_with(&[(SSH_EXT_POSIX_RENAME, b"1" as &[u8])]);
        let (slot, cb) = capture::<()>();
        sess.rename("a", "b", RENAME_OVERWRITE, cb).unwrap();
        let frame = frames.borrow()[1].clone();
        assert_eq!(frame[4], 200, "extended request");
        assert!(find_sub(&frame, SSH_EXT_POSIX_RENAME.as_bytes()));
        sess.handle_message(&reply(2, &ok_status())).unwrap();
        assert!(slot.borrow_mut().take().unwrap().is_ok());
    }

    #[test]
    fn plain_rename_packet() {
        let (mut sess, frames) = ready_session();
        let (_slot, cb) = capture::<()>();
        sess.rename("a", "b", 0, cb).unwrap();
        assert_eq!(frames.borrow()[1][4], 18, "SSH_FXP_RENAME");
    }

    #[test]
    fn responses_pair_in_any_order() {
        let (mut sess, _frames) = ready_session();
        let mut slots = Vec::new();
        for path in ["/a", "/b", "/c"] {
            let (slot, cb) = capture::<Attrs>();
            sess.stat(path, cb).unwrap();
            slots.push(slot);
        }
        assert_eq!(sess.pending_requests(), 3);

        // ids 2, 3, 4 answered in the order 4, 2, 3
        for (id, size) in [(4u32, 400u64), (2, 200), (3, 300)] {
            let attrs =
                Attrs { size: Some(size), ..Default::default() };
            sess.handle_message(&reply(id, &AttrsReply { attrs }.into()))
                .unwrap();
        }
        let sizes: Vec<u64> = slots
            .iter()
            .map(|s| {
                s.borrow_mut().take().unwrap().unwrap().size.unwrap()
            })
            .collect();
        assert_eq!(sizes, vec![200, 300, 400]);
        assert_eq!(sess.pending_requests(), 0);
    }

    #[test]
    fn end_fails_all_pending() {
        let (mut sess, _frames) = ready_session();
        let mut slots = Vec::new();
        for path in ["/a", "/b", "/c"] {
            let (slot, cb) = capture::<Attrs>();
            sess.stat(path, cb).unwrap();
            slots.push(slot);
        }
        sess.end();
        for slot in slots {
            let err = slot.borrow_mut().take().unwrap().unwrap_err();
            assert_eq!(err.code(), "ESHUTDOWN");
            assert_eq!(err.errno(), 46);
        }
        assert_eq!(sess.pending_requests(), 0);

        // later submits fail with no-connection
        let (slot, cb) = capture::<Attrs>();
        sess.stat("/d", cb).unwrap();
        sess.progress();
        let err = slot.borrow_mut().take().unwrap().unwrap_err();
        assert_eq!(err.code(), "ENOTCONN");
        assert_eq!(err.errno(), 31);
    }

    #[test]
    fn channel_close_fails_pending() {
        let (mut sess, _frames) = ready_session();
        let (slot, cb) = capture::<Attrs>();
        sess.stat("/a", cb).unwrap();
        sess.handle_close(None);
        let err = slot.borrow_mut().take().unwrap().unwrap_err();
        assert_eq!(err.errno(), 46);
        assert!(!sess.is_ready());
    }

    #[test]
    fn unknown_response_id_aborts() {
        let (mut sess, _frames) = ready_session();
        let (slot, cb) = capture::<Attrs>();
        sess.stat("/a", cb).unwrap();
        let e = sess
            .handle_message(&reply(99, &ok_status()))
            .unwrap_err();
        assert!(matches!(e, Error::SSHProtoError));
        // the in-flight request died with the session
        let err = slot.borrow_mut().take().unwrap().unwrap_err();
        assert_eq!(err.errno(), 46);
        assert!(!sess.is_ready());
    }

    #[test]
    fn unexpected_reply_type_is_fatal() {
        let (mut sess, _frames) = ready_session();
        let (slot, cb) = capture::<Attrs>();
        sess.stat("/a", cb).unwrap();
        // a HANDLE reply to a stat
        sess.handle_message(&reply(
            2,
            &Handle { handle: BinString(&[1]) }.into(),
        ))
        .unwrap();
        let err = slot.borrow_mut().take().unwrap().unwrap_err();
        assert!(matches!(err, Error::PacketWrong));
        assert!(!sess.is_ready());
    }

    #[test]
    fn foreign_handle_rejected() {
        let (mut sess_a, _fa) = ready_session();
        let (sess_b, _fb) = ready_session();
        let h = srv_handle(&sess_b, &[0xaa]);
        let e = sess_a.close(&h, |_s, _r| {}).unwrap_err();
        assert!(matches!(e, Error::BadHandle { .. }));
    }

    #[test]
    fn readdir_entries_then_end() {
        let (mut sess, _frames) = ready_session();
        let h = srv_handle(&sess, b"d1");

        let (slot, cb) = capture::<Option<Vec<DirEntry>>>();
        sess.readdir(&h, cb).unwrap();
        let entries = Name(vec![
            NameEntry {
                filename: "x".into(),
                longname: "-rw-r--r-- x".into(),
                attrs: Attrs { size: Some(1), ..Default::default() },
            },
            NameEntry {
                filename: "y".into(),
                longname: "-rw-r--r-- y".into(),
                attrs: Attrs::default(),
            },
        ]);
        sess.handle_message(&reply(2, &entries.into())).unwrap();
        let batch = slot.borrow_mut().take().unwrap().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].filename, "x");
        assert_eq!(batch[0].attrs.size, Some(1));

        let (slot, cb) = capture::<Option<Vec<DirEntry>>>();
        sess.readdir(&h, cb).unwrap();
        sess.handle_message(&reply(3, &status_of(StatusCode::SSH_FX_EOF)))
            .unwrap();
        assert!(slot.borrow_mut().take().unwrap().unwrap().is_none());
    }

    #[test]
    fn realpath_single_name() {
        let (mut sess, _frames) = ready_session();
        let (slot, cb) = capture::<String>();
        sess.realpath(".", cb).unwrap();
        let name = Name(vec![NameEntry {
            filename: "/home/me".into(),
            longname: "/home/me".into(),
            attrs: Attrs::default(),
        }]);
        sess.handle_message(&reply(2, &name.into())).unwrap();
        assert_eq!(slot.borrow_mut().take().unwrap().unwrap(), "/home/me");
    }

    #[test]
    fn realpath_rejects_multiple_names() {
        let (mut sess, _frames) = ready_session();
        let (slot, cb) = capture::<String>();
        sess.realpath(".", cb).unwrap();
        let entry = |n: &'static str| NameEntry {
            filename: n.into(),
            longname: n.into(),
            attrs: Attrs::default(),
        };
        let name = Name(vec![entry("/a"), entry("/b")]);
        sess.handle_message(&reply(2, &name.into())).unwrap();
        assert!(matches!(
            slot.borrow_mut().take().unwrap().unwrap_err(),
            Error::PacketWrong
        ));
        assert!(!sess.is_ready());
    }

    #[test]
    fn tilde_paths_are_rewritten() {
        assert_eq!(untilde("~"), ".");
        assert_eq!(untilde("~/x/y"), "./x/y");
        assert_eq!(untilde("/abs"), "/abs");
        assert_eq!(untilde("rel"), "rel");
        assert_eq!(untilde("~user/x"), "~user/x");

        let (mut sess, frames) = ready_session();
        let (_slot, cb) = capture::<Attrs>();
        sess.stat("~/f", cb).unwrap();
        assert!(find_sub(&frames.borrow()[1], b"./f"));
        assert!(!find_sub(&frames.borrow()[1], b"~"));
    }

    #[test]
    fn statvfs_gated_and_decoded() {
        // absent: fails before any bytes
        let (mut sess, frames) = ready_session();
        let (slot, cb) = capture::<StatVfs>();
        sess.statvfs("/", cb).unwrap();
        sess.progress();
        assert_eq!(slot.borrow_mut().take().unwrap().unwrap_err().errno(), 35);
        assert_eq!(frames.borrow().len(), 1);

        // advertised: request goes out, reply decodes
        let (mut sess, frames) =
            ready_session_with(&[(SSH_EXT_STATVFS, b"2" as &[u8])]);
        let (slot, cb) = capture::<StatVfs>();
        sess.statvfs("/", cb).unwrap();
        assert!(find_sub(&frames.borrow()[1], SSH_EXT_STATVFS.as_bytes()));
        let v = StatVfs {
            f_bsize: 4096,
            f_frsize: 4096,
            f_blocks: 1000,
            f_bfree: 500,
            f_bavail: 400,
            f_files: 100,
            f_ffree: 50,
            f_favail: 40,
            f_fsid: 1,
            f_flag: 0,
            f_namemax: 255,
        };
        let mut data = vec![0u8; 88];
        let l = write_ssh(&mut data, &v).unwrap();
        sess.handle_message(&reply(
            2,
            &ExtendedReply { data: &data[..l] }.into(),
        ))
        .unwrap();
        let got = slot.borrow_mut().take().unwrap().unwrap();
        assert_eq!(got.f_bavail, 400);
    }

    #[test]
    fn check_file_handle_returns_hash() {
        let (mut sess, frames) = ready_session();
        let h = srv_handle(&sess, &[0x05]);
        let (slot, cb) = capture::<FileHash>();
        sess.check_file_handle(&h, "md5,sha256", 0, 0, 0, cb).unwrap();
        assert!(find_sub(
            &frames.borrow()[1],
            SSH_EXT_CHECK_FILE_HANDLE.as_bytes()
        ));
        let mut data = vec![0u8; 64];
        let mut l = write_ssh(&mut data, &"md5").unwrap();
        data[l..l + 16].copy_from_slice(&[0x22; 16]);
        l += 16;
        sess.handle_message(&reply(
            2,
            &ExtendedReply { data: &data[..l] }.into(),
        ))
        .unwrap();
        let got = slot.borrow_mut().take().unwrap().unwrap();
        assert_eq!(got.algorithm, "md5");
        assert_eq!(got.hash, vec![0x22; 16]);
    }

    #[test]
    fn fsync_gated() {
        let (mut sess, _frames) =
            ready_session_with(&[(SSH_EXT_FSYNC, b"1" as &[u8])]);
        let h = srv_handle(&sess, &[0x09]);
        let (slot, cb) = capture::<()>();
        sess.fsync(&h, cb).unwrap();
        sess.handle_message(&reply(2, &ok_status())).unwrap();
        assert!(slot.borrow_mut().take().unwrap().is_ok());
    }

    #[test]
    fn copy_data_both_handles_checked() {
        let (mut sess, _frames) = ready_session();
        let (other, _fo) = ready_session();
        let src = srv_handle(&sess, &[1]);
        let dst = srv_handle(&other, &[2]);
        let e = sess
            .copy_data(&src, 0, 10, &dst, 0, |_s, _r| {})
            .unwrap_err();
        assert!(matches!(e, Error::BadHandle { .. }));
    }

    #[test]
    fn send_failure_completes_request() {
        init_test_log();
        let mut sess = SftpSession::default();
        // bind over a channel that accepts INIT, then break it
        let frames: SentFrames = Rc::default();
        sess.bind(Box::new(MockChannel(frames)), |_s, _r| {}).unwrap();
        sess.handle_message(&version_frame(&[])).unwrap();
        sess.channel = Some(Box::new(DeadChannel));
        let (slot, cb) = capture::<Attrs>();
        sess.stat("/a", cb).unwrap();
        sess.progress();
        assert!(slot.borrow_mut().take().unwrap().is_err());
        assert!(!sess.is_ready());
    }

    #[test]
    fn byte_counters_track_frames() {
        let (mut sess, frames) = ready_session();
        let sent_before = sess.bytes_sent();
        let (_slot, cb) = capture::<Attrs>();
        sess.stat("/a", cb).unwrap();
        let frame_len = frames.borrow()[1].len() as u64;
        assert_eq!(sess.bytes_sent(), sent_before + frame_len);
        let r = reply(2, &AttrsReply { attrs: Attrs::default() }.into());
        let received_before = sess.bytes_received();
        sess.handle_message(&r).unwrap();
        assert_eq!(sess.bytes_received(), received_before + r.len() as u64);
    }

    fn find_sub(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }
}
