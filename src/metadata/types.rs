//! Entry attributes and the on-disk value record
//!
//! Every directory entry is one row in the metadata store. The value is a
//! fixed 96-byte stat block followed by a small variable header carrying
//! the entry name, an optional backing-file path and, for small files, the
//! file body itself.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Inode numbers are 64-bit and never reused.
pub type InodeId = u64;

/// Metadata servers are addressed by their index in the cluster list.
pub type ServerId = u32;

/// Directory bit of the mode field.
pub const S_IFDIR: u32 = 0o040000;
/// Regular-file bit of the mode field.
pub const S_IFREG: u32 = 0o100000;

/// Size of the canonical stat block inside a value record.
pub const STAT_LEN: usize = 96;

/// Where a file's body lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    /// Body is embedded in the value record.
    Embedded = 1,
    /// Body lives in a backing file named by `realpath`.
    External = 2,
}

impl FileState {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(FileState::Embedded),
            2 => Some(FileState::External),
            _ => None,
        }
    }
}

/// Attributes of a namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatInfo {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub inode: InodeId,
    pub nlink: u32,
    /// For directories, the server holding the authoritative mapping row.
    pub zeroth_server: ServerId,
}

impl StatInfo {
    pub fn new_file(inode: InodeId, perm: u32, now: i64) -> Self {
        Self {
            mode: S_IFREG | (perm & 0o7777),
            uid: 0,
            gid: 0,
            size: 0,
            mtime: now,
            ctime: now,
            inode,
            nlink: 1,
            zeroth_server: 0,
        }
    }

    pub fn new_dir(inode: InodeId, perm: u32, zeroth_server: ServerId, now: i64) -> Self {
        Self {
            mode: S_IFDIR | (perm & 0o7777),
            uid: 0,
            gid: 0,
            size: 0,
            mtime: now,
            ctime: now,
            inode,
            nlink: 2,
            zeroth_server,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFDIR != 0
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.resize(start + STAT_LEN, 0);
        let b = &mut buf[start..];
        LittleEndian::write_u32(&mut b[0..4], self.mode);
        LittleEndian::write_u32(&mut b[4..8], self.uid);
        LittleEndian::write_u32(&mut b[8..12], self.gid);
        LittleEndian::write_i64(&mut b[12..20], self.size);
        LittleEndian::write_i64(&mut b[20..28], self.mtime);
        LittleEndian::write_i64(&mut b[28..36], self.ctime);
        LittleEndian::write_u64(&mut b[36..44], self.inode);
        LittleEndian::write_u32(&mut b[44..48], self.nlink);
        LittleEndian::write_u32(&mut b[48..52], self.zeroth_server);
        // Bytes 52..96 stay zero.
    }

    fn decode_from(b: &[u8]) -> Self {
        Self {
            mode: LittleEndian::read_u32(&b[0..4]),
            uid: LittleEndian::read_u32(&b[4..8]),
            gid: LittleEndian::read_u32(&b[8..12]),
            size: LittleEndian::read_i64(&b[12..20]),
            mtime: LittleEndian::read_i64(&b[20..28]),
            ctime: LittleEndian::read_i64(&b[28..36]),
            inode: LittleEndian::read_u64(&b[36..44]),
            nlink: LittleEndian::read_u32(&b[44..48]),
            zeroth_server: LittleEndian::read_u32(&b[48..52]),
        }
    }
}

/// Value-record decode errors indicate a corrupt store.
#[derive(Debug, thiserror::Error)]
#[error("corrupt entry value: {0}")]
pub struct ValueDecodeError(&'static str);

/// The value stored under an entry key.
///
/// Layout: `stat (96) | state u32 | objname_len u32 | realpath_len u32 |
/// objname NUL | realpath NUL | embedded data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryValue {
    pub stat: StatInfo,
    pub state: FileState,
    pub objname: String,
    pub realpath: String,
    pub data: Vec<u8>,
}

impl EntryValue {
    pub fn new_file(objname: &str, stat: StatInfo) -> Self {
        Self {
            stat,
            state: FileState::Embedded,
            objname: objname.to_string(),
            realpath: String::new(),
            data: Vec::new(),
        }
    }

    pub fn new_dir(objname: &str, stat: StatInfo) -> Self {
        Self {
            stat,
            state: FileState::Embedded,
            objname: objname.to_string(),
            realpath: String::new(),
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            STAT_LEN + 12 + self.objname.len() + self.realpath.len() + 2 + self.data.len(),
        );
        self.stat.encode_into(&mut buf);
        let mut header = [0u8; 12];
        LittleEndian::write_u32(&mut header[0..4], self.state as u32);
        LittleEndian::write_u32(&mut header[4..8], self.objname.len() as u32);
        LittleEndian::write_u32(&mut header[8..12], self.realpath.len() as u32);
        buf.extend_from_slice(&header);
        buf.extend_from_slice(self.objname.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.realpath.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ValueDecodeError> {
        if buf.len() < STAT_LEN + 12 + 2 {
            return Err(ValueDecodeError("record too short"));
        }
        let stat = StatInfo::decode_from(&buf[..STAT_LEN]);
        let state = LittleEndian::read_u32(&buf[STAT_LEN..STAT_LEN + 4]);
        let state = FileState::from_u32(state).ok_or(ValueDecodeError("unknown file state"))?;
        let objname_len = LittleEndian::read_u32(&buf[STAT_LEN + 4..STAT_LEN + 8]) as usize;
        let realpath_len = LittleEndian::read_u32(&buf[STAT_LEN + 8..STAT_LEN + 12]) as usize;

        let names = &buf[STAT_LEN + 12..];
        if names.len() < objname_len + realpath_len + 2 {
            return Err(ValueDecodeError("name fields truncated"));
        }
        let objname = std::str::from_utf8(&names[..objname_len])
            .map_err(|_| ValueDecodeError("entry name is not utf-8"))?
            .to_string();
        let path_start = objname_len + 1;
        let realpath = std::str::from_utf8(&names[path_start..path_start + realpath_len])
            .map_err(|_| ValueDecodeError("realpath is not utf-8"))?
            .to_string();
        let data = names[path_start + realpath_len + 1..].to_vec();

        Ok(Self {
            stat,
            state,
            objname,
            realpath,
            data,
        })
    }
}
