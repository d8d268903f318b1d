//! SFTP v3 protocol packets.
//!
//! Packet layouts follow
//! [draft-ietf-secsh-filexfer-02](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02),
//! plus the `SSH_FXP_EXTENDED` requests from
//! [draft-ietf-secsh-filexfer-extensions-00](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-extensions-00)
//! and the OpenSSH
//! [PROTOCOL](https://cvsweb.openbsd.org/src/usr.bin/ssh/PROTOCOL?annotate=HEAD)
//! extensions. A [`SftpPacket`] encodes/decodes through [`sshwire`](crate::sshwire).

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use num_enum::FromPrimitive;

use crate::attrs::Attrs;
use crate::sshwire::{
    BinString, SSHDecode, SSHEncode, SSHSink, SSHSource, TextString, WireError,
    WireResult,
};

/// The protocol version spoken, and the only one accepted from servers.
pub const SFTP_VERSION: u32 = 3;

/// Shortest well formed frame: length prefix plus type byte
pub const SFTP_MIN_FRAME_LEN: usize = 5;

/// Packet type numbers.
///
/// Requests are 1..=99, responses 101..=199, the extension mechanism
/// uses 200 and 201.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum SftpNum {
    SSH_FXP_INIT = 1,
    SSH_FXP_VERSION = 2,
    SSH_FXP_OPEN = 3,
    SSH_FXP_CLOSE = 4,
    SSH_FXP_READ = 5,
    SSH_FXP_WRITE = 6,
    SSH_FXP_LSTAT = 7,
    SSH_FXP_FSTAT = 8,
    SSH_FXP_SETSTAT = 9,
    SSH_FXP_FSETSTAT = 10,
    SSH_FXP_OPENDIR = 11,
    SSH_FXP_READDIR = 12,
    SSH_FXP_REMOVE = 13,
    SSH_FXP_MKDIR = 14,
    SSH_FXP_RMDIR = 15,
    SSH_FXP_REALPATH = 16,
    SSH_FXP_STAT = 17,
    SSH_FXP_RENAME = 18,
    SSH_FXP_READLINK = 19,
    SSH_FXP_SYMLINK = 20,
    SSH_FXP_STATUS = 101,
    SSH_FXP_HANDLE = 102,
    SSH_FXP_DATA = 103,
    SSH_FXP_NAME = 104,
    SSH_FXP_ATTRS = 105,
    SSH_FXP_EXTENDED = 200,
    SSH_FXP_EXTENDED_REPLY = 201,
    #[num_enum(catch_all)]
    Other(u8),
}

impl SftpNum {
    pub fn number(&self) -> u8 {
        match self {
            SftpNum::SSH_FXP_INIT => 1,
            SftpNum::SSH_FXP_VERSION => 2,
            SftpNum::SSH_FXP_OPEN => 3,
            SftpNum::SSH_FXP_CLOSE => 4,
            SftpNum::SSH_FXP_READ => 5,
            SftpNum::SSH_FXP_WRITE => 6,
            SftpNum::SSH_FXP_LSTAT => 7,
            SftpNum::SSH_FXP_FSTAT => 8,
            SftpNum::SSH_FXP_SETSTAT => 9,
            SftpNum::SSH_FXP_FSETSTAT => 10,
            SftpNum::SSH_FXP_OPENDIR => 11,
            SftpNum::SSH_FXP_READDIR => 12,
            SftpNum::SSH_FXP_REMOVE => 13,
            SftpNum::SSH_FXP_MKDIR => 14,
            SftpNum::SSH_FXP_RMDIR => 15,
            SftpNum::SSH_FXP_REALPATH => 16,
            SftpNum::SSH_FXP_STAT => 17,
            SftpNum::SSH_FXP_RENAME => 18,
            SftpNum::SSH_FXP_READLINK => 19,
            SftpNum::SSH_FXP_SYMLINK => 20,
            SftpNum::SSH_FXP_STATUS => 101,
            SftpNum::SSH_FXP_HANDLE => 102,
            SftpNum::SSH_FXP_DATA => 103,
            SftpNum::SSH_FXP_NAME => 104,
            SftpNum::SSH_FXP_ATTRS => 105,
            SftpNum::SSH_FXP_EXTENDED => 200,
            SftpNum::SSH_FXP_EXTENDED_REPLY => 201,
            SftpNum::Other(n) => *n,
        }
    }

    pub fn is_request(&self) -> bool {
        let n = self.number();
        (3..=99).contains(&n) || n == 200
    }

    pub fn is_response(&self) -> bool {
        let n = self.number();
        (101..=199).contains(&n) || n == 201
    }
}

impl SSHEncode for SftpNum {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        self.number().enc(s)
    }
}

impl<'de> SSHDecode<'de> for SftpNum {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(SftpNum::from(u8::dec(s)?))
    }
}

/// Status codes carried in `SSH_FXP_STATUS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum StatusCode {
    SSH_FX_OK = 0,
    SSH_FX_EOF = 1,
    SSH_FX_NO_SUCH_FILE = 2,
    SSH_FX_PERMISSION_DENIED = 3,
    SSH_FX_FAILURE = 4,
    SSH_FX_BAD_MESSAGE = 5,
    SSH_FX_NO_CONNECTION = 6,
    SSH_FX_CONNECTION_LOST = 7,
    SSH_FX_OP_UNSUPPORTED = 8,
    #[num_enum(catch_all)]
    Other(u32),
}

impl StatusCode {
    pub fn number(&self) -> u32 {
        match self {
            StatusCode::SSH_FX_OK => 0,
            StatusCode::SSH_FX_EOF => 1,
            StatusCode::SSH_FX_NO_SUCH_FILE => 2,
            StatusCode::SSH_FX_PERMISSION_DENIED => 3,
            StatusCode::SSH_FX_FAILURE => 4,
            StatusCode::SSH_FX_BAD_MESSAGE => 5,
            StatusCode::SSH_FX_NO_CONNECTION => 6,
            StatusCode::SSH_FX_CONNECTION_LOST => 7,
            StatusCode::SSH_FX_OP_UNSUPPORTED => 8,
            StatusCode::Other(n) => *n,
        }
    }
}

impl SSHEncode for StatusCode {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        self.number().enc(s)
    }
}

impl<'de> SSHDecode<'de> for StatusCode {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(StatusCode::from(u32::dec(s)?))
    }
}

/// Request id correlating a response to its request.
///
/// Ids are assigned by [`RequestMap`](crate::requests::RequestMap):
/// monotonic, wrapping mod 2^32. Id 0 is reserved, id 1 is the
/// bookkeeping id of the version handshake (that packet carries no id
/// field on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqId(pub u32);

impl SSHEncode for ReqId {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        self.0.enc(s)
    }
}

impl<'de> SSHDecode<'de> for ReqId {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(ReqId(u32::dec(s)?))
    }
}

/// Generates a packet struct with field-ordered wire encode/decode,
/// standing in for a derive.
macro_rules! wire_struct {
    ($(#[$m:meta])* pub struct $name:ident<$lt:lifetime> {
        $($(#[$fm:meta])* pub $field:ident: $ftype:ty,)*
    }) => {
        $(#[$m])*
        #[derive(Debug)]
        pub struct $name<$lt> {
            $($(#[$fm])* pub $field: $ftype,)*
        }

        impl<$lt> SSHEncode for $name<$lt> {
            fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
                $(self.$field.enc(s)?;)*
                Ok(())
            }
        }

        impl<'de: $lt, $lt> SSHDecode<'de> for $name<$lt> {
            fn dec<S>(s: &mut S) -> WireResult<Self>
            where
                S: SSHSource<'de>,
            {
                Ok(Self { $($field: SSHDecode::dec(s)?,)* })
            }
        }
    };
    ($(#[$m:meta])* pub struct $name:ident {
        $($(#[$fm:meta])* pub $field:ident: $ftype:ty,)*
    }) => {
        $(#[$m])*
        #[derive(Debug)]
        pub struct $name {
            $($(#[$fm])* pub $field: $ftype,)*
        }

        impl SSHEncode for $name {
            fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
                $(self.$field.enc(s)?;)*
                Ok(())
            }
        }

        impl<'de> SSHDecode<'de> for $name {
            fn dec<S>(s: &mut S) -> WireResult<Self>
            where
                S: SSHSource<'de>,
            {
                Ok(Self { $($field: SSHDecode::dec(s)?,)* })
            }
        }
    };
}

// Requests

wire_struct! {
    pub struct Open<'a> {
        pub filename: TextString<'a>,
        pub pflags: u32,
        pub attrs: Attrs,
    }
}

wire_struct! {
    pub struct Close<'a> {
        pub handle: BinString<'a>,
    }
}

wire_struct! {
    pub struct Read<'a> {
        pub handle: BinString<'a>,
        pub offset: u64,
        pub len: u32,
    }
}

wire_struct! {
    pub struct Write<'a> {
        pub handle: BinString<'a>,
        pub offset: u64,
        pub data: BinString<'a>,
    }
}

wire_struct! {
    pub struct Lstat<'a> {
        pub path: TextString<'a>,
    }
}

wire_struct! {
    pub struct Fstat<'a> {
        pub handle: BinString<'a>,
    }
}

wire_struct! {
    pub struct Setstat<'a> {
        pub path: TextString<'a>,
        pub attrs: Attrs,
    }
}

wire_struct! {
    pub struct Fsetstat<'a> {
        pub handle: BinString<'a>,
        pub attrs: Attrs,
    }
}

wire_struct! {
    pub struct Opendir<'a> {
        pub path: TextString<'a>,
    }
}

wire_struct! {
    pub struct Readdir<'a> {
        pub handle: BinString<'a>,
    }
}

wire_struct! {
    pub struct Remove<'a> {
        pub path: TextString<'a>,
    }
}

wire_struct! {
    pub struct Mkdir<'a> {
        pub path: TextString<'a>,
        pub attrs: Attrs,
    }
}

wire_struct! {
    pub struct Rmdir<'a> {
        pub path: TextString<'a>,
    }
}

wire_struct! {
    pub struct Realpath<'a> {
        pub path: TextString<'a>,
    }
}

wire_struct! {
    pub struct Stat<'a> {
        pub path: TextString<'a>,
    }
}

wire_struct! {
    pub struct Rename<'a> {
        pub oldpath: TextString<'a>,
        pub newpath: TextString<'a>,
    }
}

wire_struct! {
    pub struct Readlink<'a> {
        pub path: TextString<'a>,
    }
}

wire_struct! {
    /// Field order follows deployed servers (target first), not the
    /// draft text.
    pub struct Symlink<'a> {
        pub targetpath: TextString<'a>,
        pub linkpath: TextString<'a>,
    }
}

/// Payload of a `SSH_FXP_EXTENDED` request, selected by extension name.
#[derive(Debug)]
pub enum ExtendedReq<'a> {
    PosixRename {
        oldpath: TextString<'a>,
        newpath: TextString<'a>,
    },
    Hardlink {
        oldpath: TextString<'a>,
        newpath: TextString<'a>,
    },
    CopyData {
        read_handle: BinString<'a>,
        read_offset: u64,
        read_length: u64,
        write_handle: BinString<'a>,
        write_offset: u64,
    },
    CheckFileHandle {
        handle: BinString<'a>,
        algorithms: &'a str,
        start_offset: u64,
        length: u64,
        block_size: u32,
    },
    Statvfs {
        path: TextString<'a>,
    },
    Fstatvfs {
        handle: BinString<'a>,
    },
    Fsync {
        handle: BinString<'a>,
    },
}

impl SSHEncode for ExtendedReq<'_> {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        match self {
            ExtendedReq::PosixRename { oldpath, newpath }
            | ExtendedReq::Hardlink { oldpath, newpath } => {
                oldpath.enc(s)?;
                newpath.enc(s)
            }
            ExtendedReq::CopyData {
                read_handle,
                read_offset,
                read_length,
                write_handle,
                write_offset,
            } => {
                read_handle.enc(s)?;
                read_offset.enc(s)?;
                read_length.enc(s)?;
                write_handle.enc(s)?;
                write_offset.enc(s)
            }
            ExtendedReq::CheckFileHandle {
                handle,
                algorithms,
                start_offset,
                length,
                block_size,
            } => {
                handle.enc(s)?;
                algorithms.enc(s)?;
                start_offset.enc(s)?;
                length.enc(s)?;
                block_size.enc(s)
            }
            ExtendedReq::Statvfs { path } => path.enc(s),
            ExtendedReq::Fstatvfs { handle } | ExtendedReq::Fsync { handle } => {
                handle.enc(s)
            }
        }
    }
}

/// A `SSH_FXP_EXTENDED` request: extension name then its payload.
#[derive(Debug)]
pub struct Extended<'a> {
    pub name: &'a str,
    pub req: ExtendedReq<'a>,
}

impl SSHEncode for Extended<'_> {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        self.name.enc(s)?;
        self.req.enc(s)
    }
}

// A client never decodes EXTENDED requests; dec exists so the packet
// table stays uniform, and rejects.
impl<'de: 'a, 'a> SSHDecode<'de> for Extended<'a> {
    fn dec<S>(_s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Err(WireError::PacketWrong)
    }
}

// Responses

/// `SSH_FXP_STATUS`.
///
/// `message` and `lang` are decoded tolerantly: some servers omit them.
#[derive(Debug)]
pub struct Status<'a> {
    pub code: StatusCode,
    pub message: TextString<'a>,
    pub lang: TextString<'a>,
}

impl SSHEncode for Status<'_> {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        self.code.enc(s)?;
        self.message.enc(s)?;
        self.lang.enc(s)
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for Status<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let code = StatusCode::dec(s)?;
        let message =
            if s.remaining() > 0 { TextString::dec(s)? } else { TextString(&[]) };
        let lang =
            if s.remaining() > 0 { TextString::dec(s)? } else { TextString(&[]) };
        Ok(Status { code, message, lang })
    }
}

wire_struct! {
    pub struct Handle<'a> {
        pub handle: BinString<'a>,
    }
}

wire_struct! {
    pub struct Data<'a> {
        pub data: BinString<'a>,
    }
}

wire_struct! {
    pub struct NameEntry<'a> {
        pub filename: TextString<'a>,
        /// longname is an undefined text line like `ls -l` output,
        /// carried through but not interpreted.
        pub longname: TextString<'a>,
        pub attrs: Attrs,
    }
}

/// `SSH_FXP_NAME`: a count-prefixed list of entries.
#[derive(Debug)]
pub struct Name<'de>(pub Vec<NameEntry<'de>>);

impl<'de> SSHDecode<'de> for Name<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let count = u32::dec(s)? as usize;
        let mut names = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            names.push(NameEntry::dec(s)?);
        }
        Ok(Name(names))
    }
}

impl SSHEncode for Name<'_> {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        (self.0.len() as u32).enc(s)?;
        for element in self.0.iter() {
            element.enc(s)?;
        }
        Ok(())
    }
}

wire_struct! {
    pub struct AttrsReply {
        pub attrs: Attrs,
    }
}

/// `SSH_FXP_EXTENDED_REPLY`: opaque payload, shape chosen by the request
/// that it answers.
#[derive(Debug)]
pub struct ExtendedReply<'a> {
    pub data: &'a [u8],
}

impl SSHEncode for ExtendedReply<'_> {
    fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
        self.data.enc(s)
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for ExtendedReply<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let data = s.take(s.remaining())?;
        Ok(ExtendedReply { data })
    }
}

/// `f_flag` bit in a [`StatVfs`] reply
pub const SSH_FXE_STATVFS_ST_RDONLY: u64 = 0x1;
/// `f_flag` bit in a [`StatVfs`] reply
pub const SSH_FXE_STATVFS_ST_NOSUID: u64 = 0x2;

wire_struct! {
    /// Reply payload of `statvfs@openssh.com` / `fstatvfs@openssh.com`.
    pub struct StatVfs {
        pub f_bsize: u64,
        pub f_frsize: u64,
        pub f_blocks: u64,
        pub f_bfree: u64,
        pub f_bavail: u64,
        pub f_files: u64,
        pub f_ffree: u64,
        pub f_favail: u64,
        pub f_fsid: u64,
        pub f_flag: u64,
        pub f_namemax: u64,
    }
}

/// Reply payload of `check-file-handle`: the algorithm the server chose
/// from the requested list, then the digest bytes to end of frame.
#[derive(Debug)]
pub struct CheckFileReply<'a> {
    pub algorithm: &'a str,
    pub hash: &'a [u8],
}

impl<'de: 'a, 'a> SSHDecode<'de> for CheckFileReply<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let algorithm = SSHDecode::dec(s)?;
        let hash = s.take(s.remaining())?;
        Ok(CheckFileReply { algorithm, hash })
    }
}

/// A directory entry surfaced to callers, decoded out of a borrowed
/// [`NameEntry`].
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub filename: String,
    pub longname: String,
    pub attrs: Attrs,
}

impl TryFrom<&NameEntry<'_>> for DirEntry {
    type Error = WireError;

    fn try_from(e: &NameEntry<'_>) -> WireResult<Self> {
        Ok(DirEntry {
            filename: e.filename.as_str()?.to_string(),
            longname: e.longname.as_str()?.to_string(),
            attrs: e.attrs.clone(),
        })
    }
}

macro_rules! sftpmessages {
    (
        $( ( $message_num:tt,
            $SpecificPacketVariant:ident,
            $SpecificPacketType:ty,
            $SSH_FXP_NAME:ident
            ),
             )*
    ) => {

        /// Top level SFTP packet enum.
        ///
        /// Requests encode, responses decode; the version handshake
        /// (`SSH_FXP_INIT`/`SSH_FXP_VERSION`) is framed separately by the
        /// session since those packets carry no request id.
        #[derive(Debug)]
        pub enum SftpPacket<'a> {
            $(
            $SpecificPacketVariant($SpecificPacketType),
            )*
        }

        impl SSHEncode for SftpPacket<'_> {
            fn enc(&self, s: &mut dyn SSHSink) -> WireResult<()> {
                match self {
                    $(
                    SftpPacket::$SpecificPacketVariant(p) => p.enc(s),
                    )*
                }
            }
        }

        impl<'a> SftpPacket<'a> {
            /// Maps the variant to its packet number
            pub fn sftp_num(&self) -> SftpNum {
                match self {
                    $(
                    SftpPacket::$SpecificPacketVariant(_) => {
                        SftpNum::from($message_num as u8)
                    }
                    )*
                }
            }

            /// Encode a request: packet type, request id, contents.
            ///
            /// Does not include the length field.
            pub fn encode_request(
                &self,
                id: ReqId,
                s: &mut dyn SSHSink,
            ) -> WireResult<()> {
                if !self.sftp_num().is_request() {
                    return Err(WireError::PacketWrong);
                }
                self.sftp_num().enc(s)?;
                id.enc(s)?;
                self.enc(s)
            }

            /// Encode a response. Only exercised by tests standing in for
            /// a server.
            pub fn encode_response(
                &self,
                id: ReqId,
                s: &mut dyn SSHSink,
            ) -> WireResult<()> {
                if !self.sftp_num().is_response() {
                    return Err(WireError::PacketWrong);
                }
                self.sftp_num().enc(s)?;
                id.enc(s)?;
                self.enc(s)
            }

            /// Decode a response: packet type, request id, contents.
            ///
            /// Does not include the length field.
            pub fn decode_response<'de, S>(s: &mut S) -> WireResult<(ReqId, Self)>
            where
                S: SSHSource<'de>,
                'de: 'a,
            {
                let num = SftpNum::dec(s)?;
                if !num.is_response() {
                    return Err(WireError::UnknownPacket { number: num.number() });
                }
                let id = ReqId::dec(s)?;
                let p = match num {
                    $(
                    SftpNum::$SSH_FXP_NAME => {
                        SftpPacket::$SpecificPacketVariant(SSHDecode::dec(s)?)
                    }
                    )*
                    _ => {
                        return Err(WireError::UnknownPacket {
                            number: num.number(),
                        })
                    }
                };
                Ok((id, p))
            }
        }

        $(
        impl<'a> From<$SpecificPacketType> for SftpPacket<'a> {
            fn from(s: $SpecificPacketType) -> SftpPacket<'a> {
                SftpPacket::$SpecificPacketVariant(s)
            }
        }
        )*
    }
}

sftpmessages![
    // Requests
    (3, Open, Open<'a>, SSH_FXP_OPEN),
    (4, Close, Close<'a>, SSH_FXP_CLOSE),
    (5, Read, Read<'a>, SSH_FXP_READ),
    (6, Write, Write<'a>, SSH_FXP_WRITE),
    (7, Lstat, Lstat<'a>, SSH_FXP_LSTAT),
    (8, Fstat, Fstat<'a>, SSH_FXP_FSTAT),
    (9, Setstat, Setstat<'a>, SSH_FXP_SETSTAT),
    (10, Fsetstat, Fsetstat<'a>, SSH_FXP_FSETSTAT),
    (11, Opendir, Opendir<'a>, SSH_FXP_OPENDIR),
    (12, Readdir, Readdir<'a>, SSH_FXP_READDIR),
    (13, Remove, Remove<'a>, SSH_FXP_REMOVE),
    (14, Mkdir, Mkdir<'a>, SSH_FXP_MKDIR),
    (15, Rmdir, Rmdir<'a>, SSH_FXP_RMDIR),
    (16, Realpath, Realpath<'a>, SSH_FXP_REALPATH),
    (17, Stat, Stat<'a>, SSH_FXP_STAT),
    (18, Rename, Rename<'a>, SSH_FXP_RENAME),
    (19, Readlink, Readlink<'a>, SSH_FXP_READLINK),
    (20, Symlink, Symlink<'a>, SSH_FXP_SYMLINK),
    (200, Extended, Extended<'a>, SSH_FXP_EXTENDED),
    // Responses
    (101, Status, Status<'a>, SSH_FXP_STATUS),
    (102, Handle, Handle<'a>, SSH_FXP_HANDLE),
    (103, Data, Data<'a>, SSH_FXP_DATA),
    (104, Name, Name<'a>, SSH_FXP_NAME),
    (105, Attrs, AttrsReply, SSH_FXP_ATTRS),
    (201, ExtendedReply, ExtendedReply<'a>, SSH_FXP_EXTENDED_REPLY),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowtidelog::init_test_log;
    use crate::sshwire::{read_ssh, DecodeBytes, FrameSink};

    #[test]
    fn open_request_bytes() {
        init_test_log();
        let p: SftpPacket = Open {
            filename: "/a".into(),
            pflags: crate::flags::SSH_FXF_READ,
            attrs: Attrs::default(),
        }
        .into();
        let mut buf = [0u8; 64];
        let mut sink = FrameSink::new(&mut buf);
        p.encode_request(ReqId(2), &mut sink).unwrap();
        let frame = sink.finalize();
        assert_eq!(
            frame,
            &[
                0, 0, 0, 19, // length
                3, // SSH_FXP_OPEN
                0, 0, 0, 2, // id
                0, 0, 0, 2, b'/', b'a', // path
                0, 0, 0, 1, // pflags
                0, 0, 0, 0, // attr flags
            ]
        );
    }

    #[test]
    fn decode_handle_response() {
        let wire = [102u8, 0, 0, 0, 2, 0, 0, 0, 1, 0xab];
        let mut s = DecodeBytes::new(&wire);
        let (id, p) = SftpPacket::decode_response(&mut s).unwrap();
        assert_eq!(id, ReqId(2));
        match p {
            SftpPacket::Handle(h) => assert_eq!(h.handle.0, &[0xab]),
            other => panic!("wrong packet {other:?}"),
        }
    }

    #[test]
    fn decode_short_status() {
        // code only, no message or lang
        let wire = [101u8, 0, 0, 0, 9, 0, 0, 0, 1];
        let mut s = DecodeBytes::new(&wire);
        let (id, p) = SftpPacket::decode_response(&mut s).unwrap();
        assert_eq!(id, ReqId(9));
        match p {
            SftpPacket::Status(st) => {
                assert_eq!(st.code, StatusCode::SSH_FX_EOF);
                assert_eq!(st.message.0, b"");
            }
            other => panic!("wrong packet {other:?}"),
        }
    }

    #[test]
    fn request_not_accepted_as_response() {
        // SSH_FXP_OPEN arriving inbound is a violation
        let wire = [3u8, 0, 0, 0, 2, 0, 0, 0, 0];
        let mut s = DecodeBytes::new(&wire);
        let e = SftpPacket::decode_response(&mut s).unwrap_err();
        assert!(matches!(e, WireError::UnknownPacket { number: 3 }));
    }

    #[test]
    fn unknown_number() {
        let wire = [199u8, 0, 0, 0, 2];
        let mut s = DecodeBytes::new(&wire);
        let e = SftpPacket::decode_response(&mut s).unwrap_err();
        assert!(matches!(e, WireError::UnknownPacket { number: 199 }));
    }

    #[test]
    fn statvfs_reply_roundtrip() {
        let v = StatVfs {
            f_bsize: 4096,
            f_frsize: 4096,
            f_blocks: 1 << 30,
            f_bfree: 1 << 29,
            f_bavail: 1 << 28,
            f_files: 1 << 20,
            f_ffree: 1 << 19,
            f_favail: 1 << 18,
            f_fsid: 77,
            f_flag: SSH_FXE_STATVFS_ST_RDONLY,
            f_namemax: 255,
        };
        let mut buf = [0u8; 11 * 8];
        let l = crate::sshwire::write_ssh(&mut buf, &v).unwrap();
        assert_eq!(l, 88);
        let got: StatVfs = read_ssh(&buf[..l]).unwrap();
        assert_eq!(got.f_bavail, v.f_bavail);
        assert_eq!(got.f_flag, SSH_FXE_STATVFS_ST_RDONLY);
        assert_eq!(got.f_namemax, 255);
    }

    #[test]
    fn check_file_reply_decode() {
        let mut wire = vec![0, 0, 0, 3];
        wire.extend_from_slice(b"md5");
        wire.extend_from_slice(&[0x11; 16]);
        let r: CheckFileReply = read_ssh(&wire).unwrap();
        assert_eq!(r.algorithm, "md5");
        assert_eq!(r.hash, &[0x11; 16]);
    }
}
