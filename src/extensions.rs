//! Named SFTP extensions and the capability map derived from them.
//!
//! Servers advertise `(name, data)` extension pairs in the
//! `SSH_FXP_VERSION` packet. Names and payload shapes come from the
//! OpenSSH [PROTOCOL](https://cvsweb.openbsd.org/src/usr.bin/ssh/PROTOCOL?annotate=HEAD)
//! file, [draft-ietf-secsh-filexfer-extensions-00](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-extensions-00),
//! the later filexfer drafts (`supported`/`supported2`) and a few vendor
//! conventions. This module also serves as the index of extension names.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::BTreeMap;

use crate::sshwire::{DecodeBytes, SSHDecode, SSHSource, WireResult};

/// OpenSSH PROTOCOL section 4.4, version `1`
pub const SSH_EXT_HARDLINK: &str = "hardlink@openssh.com";
/// OpenSSH PROTOCOL section 4.3, version `1`
pub const SSH_EXT_POSIX_RENAME: &str = "posix-rename@openssh.com";
/// OpenSSH PROTOCOL section 4.4, version `2`
pub const SSH_EXT_STATVFS: &str = "statvfs@openssh.com";
/// OpenSSH PROTOCOL section 4.4, version `2`
pub const SSH_EXT_FSTATVFS: &str = "fstatvfs@openssh.com";
/// OpenSSH PROTOCOL section 4.5, version `1`
pub const SSH_EXT_FSYNC: &str = "fsync@openssh.com";
pub const SSH_EXT_NEWLINE_SFTPWS: &str = "newline@sftp.ws";
/// [draft-ietf-secsh-filexfer-13](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-13#section-5.3)
pub const SSH_EXT_NEWLINE: &str = "newline";
/// VShell convention, a single string payload
pub const SSH_EXT_NEWLINE_VANDYKE: &str = "newline@vandyke.com";
pub const SSH_EXT_CHARSET: &str = "charset@sftp.ws";
/// Reserved name of the metadata attribute pair
pub const SSH_EXT_META: &str = "meta@sftp.ws";
/// [draft-ietf-secsh-filexfer-13](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-13#section-5.5)
pub const SSH_EXT_VERSIONS: &str = "versions";
/// [draft-ietf-secsh-filexfer-extensions-00](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-extensions-00#section-4)
pub const SSH_EXT_VENDOR_ID: &str = "vendor-id";
/// [draft-ietf-secsh-filexfer-extensions-00](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-extensions-00#section-6)
pub const SSH_EXT_COPY_FILE: &str = "copy-file";
/// [draft-ietf-secsh-filexfer-extensions-00](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-extensions-00#section-7)
pub const SSH_EXT_COPY_DATA: &str = "copy-data";
/// [draft-ietf-secsh-filexfer-extensions-00](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-extensions-00#section-9)
pub const SSH_EXT_CHECK_FILE: &str = "check-file";
pub const SSH_EXT_CHECK_FILE_HANDLE: &str = "check-file-handle";
pub const SSH_EXT_CHECK_FILE_NAME: &str = "check-file-name";
/// [draft-ietf-secsh-filexfer-05](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-05#section-4.2)
pub const SSH_EXT_SUPPORTED: &str = "supported";
/// [draft-ietf-secsh-filexfer-13](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-13#section-5.4)
pub const SSH_EXT_SUPPORTED2: &str = "supported2";
/// VShell filesystem description
pub const SSH_EXT_DEFAULT_FS_ATTRIBS: &str = "default-fs-attribs@vandyke.com";
pub const SSH_EXT_SYMLINK_ORDER: &str = "symlink-order@rjk.greenend.org.uk";
pub const SSH_EXT_LINK_ORDER: &str = "link-order@rjk.greenend.org.uk";

/// Extension names this client understands.
///
/// An explicit allowlist; membership is never discovered by reflection.
pub static KNOWN_EXTENSIONS: &[&str] = &[
    SSH_EXT_HARDLINK,
    SSH_EXT_POSIX_RENAME,
    SSH_EXT_STATVFS,
    SSH_EXT_FSTATVFS,
    SSH_EXT_FSYNC,
    SSH_EXT_NEWLINE_SFTPWS,
    SSH_EXT_NEWLINE,
    SSH_EXT_NEWLINE_VANDYKE,
    SSH_EXT_CHARSET,
    SSH_EXT_META,
    SSH_EXT_VERSIONS,
    SSH_EXT_VENDOR_ID,
    SSH_EXT_COPY_FILE,
    SSH_EXT_COPY_DATA,
    SSH_EXT_CHECK_FILE,
    SSH_EXT_CHECK_FILE_HANDLE,
    SSH_EXT_CHECK_FILE_NAME,
    SSH_EXT_SUPPORTED,
    SSH_EXT_SUPPORTED2,
    SSH_EXT_DEFAULT_FS_ATTRIBS,
    SSH_EXT_SYMLINK_ORDER,
    SSH_EXT_LINK_ORDER,
];

pub fn is_known(name: &str) -> bool {
    KNOWN_EXTENSIONS.contains(&name)
}

/// Returns whether `value` appears in a comma separated list.
///
/// Servers advertise multiple supported versions as `"1,2"`.
pub fn csv_contains(list: &str, value: &str) -> bool {
    list.split(',').any(|v| v == value)
}

/// Decoded `vendor-id` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorId {
    pub vendor_name: String,
    pub product_name: String,
    pub product_version: String,
    pub product_build: i64,
}

/// Decoded `supported` (v1) or `supported2` payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Supported {
    pub supported_attribute_mask: u32,
    pub supported_attribute_bits: u32,
    pub supported_open_flags: u32,
    pub supported_access_mask: u32,
    pub max_read_size: u32,
    /// `supported2` only
    pub supported_open_block_vector: Option<u16>,
    /// `supported2` only
    pub supported_block_vector: Option<u16>,
    /// `supported2` only, bounded by its declared count
    pub attrib_extension_names: Vec<String>,
    /// count-bounded for `supported2`, to end of payload for `supported`
    pub extension_names: Vec<String>,
}

/// Decoded `default-fs-attribs@vandyke.com` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultFsAttribs {
    pub case_preserved: bool,
    pub case_sensitive: bool,
    pub illegal_characters: String,
    pub reserved_names: Vec<String>,
}

/// One advertised extension value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtValue {
    /// Plain text payload of a known extension
    Str(String),
    /// Unknown extension, or a payload that failed its structured decode
    Raw(Vec<u8>),
    VendorId(VendorId),
    Newline(String),
    Supported(Supported),
    DefaultFsAttribs(DefaultFsAttribs),
}

fn dec_string<'de, S>(s: &mut S) -> WireResult<String>
where
    S: SSHSource<'de>,
{
    let b = crate::sshwire::BinString::dec(s)?;
    String::from_utf8(b.0.to_vec())
        .map_err(|_| crate::sshwire::WireError::BadString)
}

fn dec_vendor_id(data: &[u8]) -> WireResult<VendorId> {
    let mut s = DecodeBytes::new(data);
    Ok(VendorId {
        vendor_name: dec_string(&mut s)?,
        product_name: dec_string(&mut s)?,
        product_version: dec_string(&mut s)?,
        product_build: i64::dec(&mut s)?,
    })
}

fn dec_supported(data: &[u8], v2: bool) -> WireResult<Supported> {
    let mut s = DecodeBytes::new(data);
    let mut sup = Supported {
        supported_attribute_mask: u32::dec(&mut s)?,
        supported_attribute_bits: u32::dec(&mut s)?,
        supported_open_flags: u32::dec(&mut s)?,
        supported_access_mask: u32::dec(&mut s)?,
        max_read_size: u32::dec(&mut s)?,
        ..Default::default()
    };
    if v2 {
        sup.supported_open_block_vector = Some(u16::dec(&mut s)?);
        sup.supported_block_vector = Some(u16::dec(&mut s)?);
        let count = u32::dec(&mut s)?;
        for _ in 0..count {
            sup.attrib_extension_names.push(dec_string(&mut s)?);
        }
        let count = u32::dec(&mut s)?;
        for _ in 0..count {
            sup.extension_names.push(dec_string(&mut s)?);
        }
    } else {
        while s.remaining() > 0 {
            sup.extension_names.push(dec_string(&mut s)?);
        }
    }
    Ok(sup)
}

fn dec_default_fs_attribs(data: &[u8]) -> WireResult<DefaultFsAttribs> {
    let mut s = DecodeBytes::new(data);
    let case_preserved = bool::dec(&mut s)?;
    let case_sensitive = bool::dec(&mut s)?;
    let illegal_characters = dec_string(&mut s)?;
    let mut reserved_names = Vec::new();
    while s.remaining() > 0 {
        reserved_names.push(dec_string(&mut s)?);
    }
    Ok(DefaultFsAttribs {
        case_preserved,
        case_sensitive,
        illegal_characters,
        reserved_names,
    })
}

fn dec_newline(data: &[u8]) -> WireResult<String> {
    let mut s = DecodeBytes::new(data);
    dec_string(&mut s)
}

/// The extensions a server advertised, keyed by name. Captured once at
/// handshake.
#[derive(Debug, Clone, Default)]
pub struct ExtensionMap(BTreeMap<String, ExtValue>);

impl ExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one advertised pair.
    ///
    /// Structured payloads are parsed; a payload that fails its parse is
    /// kept raw rather than failing the handshake. Repeats of an
    /// `@openssh.com` name concatenate with a comma, servers use that to
    /// advertise several versions.
    pub fn insert(&mut self, name: &str, data: &[u8]) {
        if name.ends_with("@openssh.com") {
            if let Ok(v) = core::str::from_utf8(data) {
                match self.0.get_mut(name) {
                    Some(ExtValue::Str(prev)) => {
                        prev.push(',');
                        prev.push_str(v);
                    }
                    _ => {
                        self.0.insert(name.to_string(), ExtValue::Str(v.into()));
                    }
                }
            } else {
                self.0.insert(name.to_string(), ExtValue::Raw(data.to_vec()));
            }
            return;
        }

        let parsed = match name {
            SSH_EXT_VENDOR_ID => dec_vendor_id(data).map(ExtValue::VendorId),
            SSH_EXT_NEWLINE_VANDYKE => dec_newline(data).map(ExtValue::Newline),
            SSH_EXT_SUPPORTED => {
                dec_supported(data, false).map(ExtValue::Supported)
            }
            SSH_EXT_SUPPORTED2 => {
                dec_supported(data, true).map(ExtValue::Supported)
            }
            SSH_EXT_DEFAULT_FS_ATTRIBS => {
                dec_default_fs_attribs(data).map(ExtValue::DefaultFsAttribs)
            }
            _ if is_known(name) => core::str::from_utf8(data)
                .map(|v| ExtValue::Str(v.into()))
                .map_err(|_| crate::sshwire::WireError::BadString),
            _ => {
                self.0.insert(name.to_string(), ExtValue::Raw(data.to_vec()));
                return;
            }
        };

        let value = match parsed {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to decode extension {name}: {e:?}");
                ExtValue::Raw(data.to_vec())
            }
        };
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ExtValue> {
        self.0.get(name)
    }

    /// The plain text value of an extension, if it decoded as one
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(ExtValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExtValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A capability gating an operation.
///
/// Presence means the operation is issued via its named extension;
/// absence fails the operation with `SSH_FX_OP_UNSUPPORTED` before any
/// packet is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Hardlink,
    PosixRename,
    CopyData,
    CheckFileHandle,
    Statvfs,
    Fstatvfs,
    Fsync,
}

/// Capabilities derived from an [`ExtensionMap`] at handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureSet {
    hardlink: bool,
    posix_rename: bool,
    statvfs: bool,
    fstatvfs: bool,
    fsync: bool,
}

impl FeatureSet {
    pub fn from_extensions(ext: &ExtensionMap) -> Self {
        let advertises = |name: &str, version: &str| {
            ext.text(name).map(|v| csv_contains(v, version)).unwrap_or(false)
        };
        FeatureSet {
            hardlink: advertises(SSH_EXT_HARDLINK, "1"),
            posix_rename: advertises(SSH_EXT_POSIX_RENAME, "1"),
            statvfs: advertises(SSH_EXT_STATVFS, "2"),
            fstatvfs: advertises(SSH_EXT_FSTATVFS, "2"),
            fsync: advertises(SSH_EXT_FSYNC, "1"),
        }
    }

    pub fn has(&self, f: Feature) -> bool {
        match f {
            Feature::Hardlink => self.hardlink,
            Feature::PosixRename => self.posix_rename,
            // always issued, servers without them answer with a status
            Feature::CopyData | Feature::CheckFileHandle => true,
            Feature::Statvfs => self.statvfs,
            Feature::Fstatvfs => self.fstatvfs,
            Feature::Fsync => self.fsync,
        }
    }
}
