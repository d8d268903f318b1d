//! File attribute blocks.
//!
//! The variable-shape record of
//! [draft-ietf-secsh-filexfer-02 section 5](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02#section-5):
//! a `u32` flags word followed by the fields the flags declare, in fixed
//! order. The `EXTENDED` bit appends a count-prefixed list of
//! `(name, data)` pairs; one reserved pair carries the typed
//! [`Metadata`] sub-block.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::str;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::extensions::SSH_EXT_META;
use crate::sshwire::{
    length_enc, BinString, DecodeBytes, SSHDecode, SSHEncode, SSHSink, SSHSource,
    WireError, WireResult,
};

pub const SSH_FILEXFER_ATTR_SIZE: u32 = 0x00000001;
pub const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x00000002;
pub const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x00000004;
pub const SSH_FILEXFER_ATTR_ACMODTIME: u32 = 0x00000008;
pub const SSH_FILEXFER_ATTR_EXTENDED: u32 = 0x80000000;

/// The four basic field bits
pub const SSH_FILEXFER_ATTR_BASIC: u32 = 0x0000000f;

// POSIX file type nibble of the permissions word
pub const S_IFMT: u32 = 0xf000;
pub const S_IFIFO: u32 = 0x1000;
pub const S_IFCHR: u32 = 0x2000;
pub const S_IFDIR: u32 = 0x4000;
pub const S_IFBLK: u32 = 0x6000;
pub const S_IFREG: u32 = 0x8000;
pub const S_IFLNK: u32 = 0xa000;
pub const S_IFSOCK: u32 = 0xc000;

/// File kind taken from the type nibble of a mode word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => FileType::Regular,
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            S_IFCHR => FileType::CharDevice,
            S_IFBLK => FileType::BlockDevice,
            S_IFIFO => FileType::Fifo,
            S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }
}

/// One typed value in a [`Metadata`] block.
///
/// `Json` carries an undecoded JSON document; interpreting it is the
/// consumer's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Json(String),
}

const META_TAG_NULL: u8 = 0;
const META_TAG_BOOL: u8 = 1;
const META_TAG_INT: u8 = 2;
const META_TAG_STR: u8 = 3;
const META_TAG_JSON: u8 = 4;

/// The metadata sub-block: `(key, tag, value)` entries, terminated by a
/// zero-length key. Entries with an unknown tag are skipped, not fatal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata(pub Vec<(String, MetaValue)>);

impl Metadata {
    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl SSHEncode for Metadata {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        for (k, v) in self.0.iter() {
            k.as_str().enc(s)?;
            match v {
                MetaValue::Null => META_TAG_NULL.enc(s)?,
                MetaValue::Bool(b) => {
                    META_TAG_BOOL.enc(s)?;
                    b.enc(s)?;
                }
                MetaValue::Int(i) => {
                    META_TAG_INT.enc(s)?;
                    i.enc(s)?;
                }
                MetaValue::Str(t) => {
                    META_TAG_STR.enc(s)?;
                    t.as_str().enc(s)?;
                }
                MetaValue::Json(t) => {
                    META_TAG_JSON.enc(s)?;
                    t.as_str().enc(s)?;
                }
            }
        }
        // zero-length key terminates the block
        "".enc(s)
    }
}

impl<'de> SSHDecode<'de> for Metadata {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let mut entries = Vec::new();
        loop {
            let key = BinString::dec(s)?;
            if key.0.is_empty() {
                break;
            }
            let key = str::from_utf8(key.0)
                .map_err(|_| WireError::BadString)?
                .to_string();
            let tag = u8::dec(s)?;
            let v = match tag {
                META_TAG_NULL => MetaValue::Null,
                META_TAG_BOOL => MetaValue::Bool(u8::dec(s)? != 0),
                META_TAG_INT => MetaValue::Int(i64::dec(s)?),
                META_TAG_STR => MetaValue::Str(dec_string(s)?),
                META_TAG_JSON => MetaValue::Json(dec_string(s)?),
                other => {
                    // unknown tag: its value is one string, skip it
                    trace!("skipping metadata tag {other} for key {key}");
                    let _ = BinString::dec(s)?;
                    continue;
                }
            };
            entries.push((key, v));
        }
        Ok(Metadata(entries))
    }
}

fn dec_string<'de, S>(s: &mut S) -> WireResult<String>
where
    S: SSHSource<'de>,
{
    let b = BinString::dec(s)?;
    String::from_utf8(b.0.to_vec()).map_err(|_| WireError::BadString)
}

/// A file attribute record.
///
/// The wire flags word is derived from which fields are present, so a
/// decoded record never exposes raw flag bits to callers. `nlink` is not
/// carried by the v3 wire encoding; upper layers may fill it from
/// directory listings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Attrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub nlink: Option<u32>,
    pub metadata: Option<Metadata>,
}

impl Attrs {
    /// The wire flags word for this record
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.uid.is_some() || self.gid.is_some() {
            flags |= SSH_FILEXFER_ATTR_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.atime.is_some() || self.mtime.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACMODTIME;
        }
        if self.metadata.is_some() {
            flags |= SSH_FILEXFER_ATTR_EXTENDED;
        }
        flags
    }

    pub fn file_type(&self) -> FileType {
        match self.permissions {
            Some(mode) => FileType::from_mode(mode),
            None => FileType::Unknown,
        }
    }
}

fn unix_secs(t: SystemTime) -> u32 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

fn from_unix_secs(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs as u64)
}

impl SSHEncode for Attrs {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        let flags = self.flags();
        flags.enc(s)?;

        // Order matters, fields follow the flags word in flag-bit order
        if let Some(size) = self.size {
            size.enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            self.uid.unwrap_or(0).enc(s)?;
            self.gid.unwrap_or(0).enc(s)?;
        }
        if let Some(perm) = self.permissions {
            perm.enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            unix_secs(self.atime.unwrap_or(UNIX_EPOCH)).enc(s)?;
            unix_secs(self.mtime.unwrap_or(UNIX_EPOCH)).enc(s)?;
        }
        if let Some(meta) = self.metadata.as_ref() {
            // one extended pair: reserved name, metadata block as the data
            1u32.enc(s)?;
            SSH_EXT_META.enc(s)?;
            length_enc(meta)?.enc(s)?;
            meta.enc(s)?;
        }
        Ok(())
    }
}

impl<'de> SSHDecode<'de> for Attrs {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let mut attrs = Attrs::default();
        let flags = u32::dec(s)?;
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(u64::dec(s)?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            attrs.uid = Some(u32::dec(s)?);
            attrs.gid = Some(u32::dec(s)?);
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(u32::dec(s)?);
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            attrs.atime = Some(from_unix_secs(u32::dec(s)?));
            attrs.mtime = Some(from_unix_secs(u32::dec(s)?));
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            let count = u32::dec(s)?;
            for _ in 0..count {
                let name = BinString::dec(s)?;
                let data = BinString::dec(s)?;
                if name.0 == SSH_EXT_META.as_bytes() {
                    let mut ds = DecodeBytes::new(data.0);
                    attrs.metadata = Some(Metadata::dec(&mut ds)?);
                } else {
                    trace!("skipping attr extension {:?}", name);
                }
            }
        }
        Ok(attrs)
    }
}
