//! SFTP version 3 wire types
//!
//! Packet type numbers, status codes, open flags and the attribute block of
//! draft-ietf-secsh-filexfer-02, plus the string and integer primitives used to
//! read and write packet bodies. The protocol runs as the `sftp` subsystem of an
//! SSH session channel (RFC 4254).

use bytes::{BufMut, BytesMut};

/// Protocol version answered to INIT
pub const SFTP_VERSION: u32 = 3;

/// Subsystem name requested by SFTP clients
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// Declares a numbered wire enum together with its checked conversion from the
/// raw number. Unknown numbers are protocol errors.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident($repr:ident, $what:literal) {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[repr($repr)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[allow(missing_docs)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl TryFrom<$repr> for $name {
            type Error = crate::Error;

            fn try_from(value: $repr) -> crate::Result<Self> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    unknown => Err(crate::Error::Protocol(format!(
                        concat!("Unknown ", $what, ": {}"),
                        unknown
                    ))),
                }
            }
        }
    };
}

wire_enum! {
    /// Packet type byte
    MessageType(u8, "message type") {
        Init = 1,
        Version = 2,
        Open = 3,
        Close = 4,
        Read = 5,
        Write = 6,
        /// Attributes without following a final symlink
        Lstat = 7,
        Fstat = 8,
        Setstat = 9,
        Fsetstat = 10,
        Opendir = 11,
        Readdir = 12,
        Remove = 13,
        Mkdir = 14,
        Rmdir = 15,
        Realpath = 16,
        Stat = 17,
        Rename = 18,
        Readlink = 19,
        Symlink = 20,
        Status = 101,
        Handle = 102,
        Data = 103,
        /// One or more filename entries (READDIR, REALPATH)
        Name = 104,
        Attrs = 105,
        /// Vendor request carrying its own name string
        Extended = 200,
        ExtendedReply = 201,
    }
}

wire_enum! {
    /// Status codes carried by STATUS replies
    StatusCode(u32, "status code") {
        Ok = 0,
        /// Read past end of file, or listing drained
        Eof = 1,
        NoSuchFile = 2,
        PermissionDenied = 3,
        Failure = 4,
        /// Malformed packet or rejected path
        BadMessage = 5,
        NoConnection = 6,
        ConnectionLost = 7,
        /// Operation refused by this server
        OpUnsupported = 8,
    }
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> Self {
        code as Self
    }
}

/// `pflags` word of an OPEN request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

#[allow(missing_docs)]
impl OpenFlags {
    pub const READ: u32 = 0x01;
    pub const WRITE: u32 = 0x02;
    pub const APPEND: u32 = 0x04;
    pub const CREAT: u32 = 0x08;
    pub const TRUNC: u32 = 0x10;
    pub const EXCL: u32 = 0x20;
}

impl OpenFlags {
    /// Bits that make an OPEN a write-open
    const WRITE_INTENT: u32 = Self::WRITE | Self::APPEND | Self::CREAT | Self::TRUNC;

    /// `true` if every bit in `bits` is set
    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    /// `true` if the client asked for anything beyond reading
    pub fn opens_for_write(self) -> bool {
        self.0 & Self::WRITE_INTENT != 0
    }
}

const ATTR_SIZE: u32 = 0x01;
const ATTR_UIDGID: u32 = 0x02;
const ATTR_PERMISSIONS: u32 = 0x04;
const ATTR_ACMODTIME: u32 = 0x08;
const ATTR_EXTENDED: u32 = 0x8000_0000;

/// Mask and value of the directory bits in a Unix mode word
const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;

/// ATTRS block; absent fields are left out of the encoding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Unix mode, file-type bits included
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttrs {
    /// Attributes reported for a file or directory on disk
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let mtime = epoch_secs(metadata.modified());
        let atime = epoch_secs(metadata.accessed()).or(mtime);

        #[cfg(unix)]
        let (uid, gid, mode) = {
            use std::os::unix::fs::MetadataExt;
            (Some(metadata.uid()), Some(metadata.gid()), metadata.mode())
        };

        #[cfg(not(unix))]
        let (uid, gid, mode) = {
            let kind = if metadata.is_dir() { S_IFDIR } else { S_IFREG };
            let access = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
            (None, None, kind | access)
        };

        Self {
            size: Some(metadata.len()),
            uid,
            gid,
            permissions: Some(mode),
            atime,
            mtime,
        }
    }

    /// `true` if the mode word marks a directory
    pub fn is_dir(&self) -> bool {
        self.permissions.is_some_and(|mode| mode & S_IFMT == S_IFDIR)
    }

    /// `true` if the mode word marks a regular file
    pub fn is_file(&self) -> bool {
        self.permissions.is_some_and(|mode| mode & S_IFMT == S_IFREG)
    }

    /// Wire form: flags word, then each present field in draft order
    pub fn encode(&self) -> BytesMut {
        let ids = self.uid.zip(self.gid);
        let times = self.atime.zip(self.mtime);

        let flags = [
            (self.size.is_some(), ATTR_SIZE),
            (ids.is_some(), ATTR_UIDGID),
            (self.permissions.is_some(), ATTR_PERMISSIONS),
            (times.is_some(), ATTR_ACMODTIME),
        ]
        .iter()
        .filter(|(present, _)| *present)
        .fold(0, |acc, (_, bit)| acc | bit);

        let mut out = BytesMut::with_capacity(32);
        out.put_u32(flags);
        if let Some(size) = self.size {
            out.put_u64(size);
        }
        if let Some((uid, gid)) = ids {
            out.put_u32(uid);
            out.put_u32(gid);
        }
        if let Some(mode) = self.permissions {
            out.put_u32(mode);
        }
        if let Some((atime, mtime)) = times {
            out.put_u32(atime);
            out.put_u32(mtime);
        }
        out
    }

    /// Parse an ATTRS block, dropping any extended name/value pairs
    ///
    /// # Errors
    ///
    /// Returns a `Protocol` error when the block is truncated.
    pub fn decode(buf: &mut &[u8]) -> crate::Result<Self> {
        let flags = codec::get_u32(buf)?;
        let has = |bit: u32| flags & bit != 0;

        let size = if has(ATTR_SIZE) { Some(codec::get_u64(buf)?) } else { None };
        let (uid, gid) = if has(ATTR_UIDGID) {
            (Some(codec::get_u32(buf)?), Some(codec::get_u32(buf)?))
        } else {
            (None, None)
        };
        let permissions = if has(ATTR_PERMISSIONS) { Some(codec::get_u32(buf)?) } else { None };
        let (atime, mtime) = if has(ATTR_ACMODTIME) {
            (Some(codec::get_u32(buf)?), Some(codec::get_u32(buf)?))
        } else {
            (None, None)
        };

        if has(ATTR_EXTENDED) {
            for _ in 0..codec::get_u32(buf)? {
                codec::skip_string(buf)?;
                codec::skip_string(buf)?;
            }
        }

        Ok(Self {
            size,
            uid,
            gid,
            permissions,
            atime,
            mtime,
        })
    }
}

fn epoch_secs(time: std::io::Result<std::time::SystemTime>) -> Option<u32> {
    let since_epoch = time.ok()?.duration_since(std::time::UNIX_EPOCH).ok()?;
    u32::try_from(since_epoch.as_secs()).ok()
}

/// Big-endian integers and length-prefixed strings
///
/// Readers take `&mut &[u8]` and advance it past what they consumed.
pub mod codec {
    use crate::{Error, Result};
    use bytes::{BufMut, BytesMut};

    fn take<'a>(buf: &mut &'a [u8], len: usize, what: &str) -> Result<&'a [u8]> {
        if buf.len() < len {
            return Err(Error::Protocol(format!(
                "Truncated {}: need {} bytes, have {}",
                what,
                len,
                buf.len()
            )));
        }
        let (head, tail) = buf.split_at(len);
        *buf = tail;
        Ok(head)
    }

    /// Read a `uint32`
    pub fn get_u32(buf: &mut &[u8]) -> Result<u32> {
        let raw = take(buf, 4, "uint32")?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read a `uint64`
    pub fn get_u64(buf: &mut &[u8]) -> Result<u64> {
        let high = u64::from(get_u32(buf)?);
        let low = u64::from(get_u32(buf)?);
        Ok((high << 32) | low)
    }

    /// Read a length-prefixed byte string
    pub fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
        let len = get_u32(buf)? as usize;
        Ok(take(buf, len, "string")?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string
    pub fn get_string(buf: &mut &[u8]) -> Result<String> {
        String::from_utf8(get_bytes(buf)?)
            .map_err(|e| Error::Protocol(format!("String is not UTF-8: {}", e)))
    }

    /// Advance past a length-prefixed string without copying it
    pub fn skip_string(buf: &mut &[u8]) -> Result<()> {
        let len = get_u32(buf)? as usize;
        take(buf, len, "string").map(drop)
    }

    /// Write a length-prefixed byte string
    pub fn put_bytes(out: &mut BytesMut, data: &[u8]) {
        out.put_u32(u32::try_from(data.len()).unwrap_or(u32::MAX));
        out.put_slice(data);
    }

    /// Write a length-prefixed UTF-8 string
    pub fn put_string(out: &mut BytesMut, s: &str) {
        put_bytes(out, s.as_bytes());
    }
}
