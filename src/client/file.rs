//! Client-side file descriptors
//!
//! `open` yields a small integer descriptor. Embedded files are read and
//! written through the metadata server; once a file spills to a backing
//! file, the descriptor holds the backing handles and bypasses the
//! server for the data path. The first write that pushes an embedded
//! body past the threshold gets the old bytes back from the server and
//! replays them into the backing file before appending its own.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use super::{unexpected_reply, FsClient};
use crate::metadata::{InodeId, ServerId};
use crate::rpc::proto::{Reply, Request, OPEN_READ, OPEN_WRITE};
use crate::rpc::FsError;

/// Descriptor slots per client.
pub(crate) const MAX_FDS: usize = 1024;

pub(crate) struct FileDescriptor {
    pub parent: InodeId,
    pub zeroth_server: ServerId,
    pub name: String,
    pub mode: u32,
    pub reader: Option<File>,
    pub writer: Option<File>,
}

pub(crate) struct FdTable {
    slots: Vec<Option<FileDescriptor>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_FDS).map(|_| None).collect(),
        }
    }

    pub fn alloc(&mut self, descriptor: FileDescriptor) -> Option<usize> {
        let free = self.slots.iter().position(|slot| slot.is_none())?;
        self.slots[free] = Some(descriptor);
        Some(free)
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut FileDescriptor> {
        self.slots.get_mut(fd)?.as_mut()
    }

    pub fn take(&mut self, fd: usize) -> Option<FileDescriptor> {
        self.slots.get_mut(fd)?.take()
    }
}

fn bad_fd() -> FsError {
    FsError::Io("bad file descriptor".to_string())
}

impl FsClient {
    /// Open a file and return its descriptor. `mode` is a combination of
    /// [`OPEN_READ`] and [`OPEN_WRITE`].
    pub fn open(&self, path: &str, mode: u32) -> Result<usize, FsError> {
        let resolved = self.resolve_path(path)?;
        let handle = self.fetch_dir(resolved.parent, resolved.zeroth_server)?;
        let reply = self.call_entry_op(&handle, &resolved.name, || Request::OpenFile {
            dir_id: resolved.parent,
            name: resolved.name.clone(),
            mode,
        })?;
        let open = match reply {
            Reply::Open(open) => open,
            _ => return Err(unexpected_reply()),
        };

        let mut descriptor = FileDescriptor {
            parent: resolved.parent,
            zeroth_server: resolved.zeroth_server,
            name: resolved.name,
            mode,
            reader: None,
            writer: None,
        };
        if !open.is_embedded {
            if mode & OPEN_READ != 0 {
                descriptor.reader =
                    Some(File::open(&open.path).map_err(|e| FsError::Io(e.to_string()))?);
            }
            if mode & OPEN_WRITE != 0 {
                descriptor.writer = Some(open_for_append(&open.path)?);
            }
        }

        self.files
            .lock()
            .alloc(descriptor)
            .ok_or_else(|| FsError::Io("out of file descriptors".to_string()))
    }

    /// Read up to `size` bytes at `offset`.
    pub fn read(&self, fd: usize, offset: u64, size: usize) -> Result<Vec<u8>, FsError> {
        let mut files = self.files.lock();
        let descriptor = files.get_mut(fd).ok_or_else(bad_fd)?;

        if descriptor.reader.is_none() {
            let (parent, zeroth_server, name) = (
                descriptor.parent,
                descriptor.zeroth_server,
                descriptor.name.clone(),
            );
            let handle = self.fetch_dir(parent, zeroth_server)?;
            let reply = self.call_entry_op(&handle, &name, || Request::ReadFile {
                dir_id: parent,
                name: name.clone(),
                offset,
                size: size as u32,
            })?;
            let read = match reply {
                Reply::Read(read) => read,
                _ => return Err(unexpected_reply()),
            };
            if read.is_embedded {
                return Ok(read.data);
            }
            // The file spilled since open: attach the backing file.
            let file = File::open(&read.path).map_err(|e| FsError::Io(e.to_string()))?;
            let descriptor = files.get_mut(fd).ok_or_else(bad_fd)?;
            descriptor.reader = Some(file);
        }

        let descriptor = files.get_mut(fd).ok_or_else(bad_fd)?;
        let reader = descriptor.reader.as_mut().ok_or_else(bad_fd)?;
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| FsError::Io(e.to_string()))?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = reader
                .read(&mut buf[filled..])
                .map_err(|e| FsError::Io(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Write `data` at `offset`. Backing files are append-only on this
    /// path; offsets matter only while the body is embedded.
    pub fn write(&self, fd: usize, offset: u64, data: &[u8]) -> Result<(), FsError> {
        let mut files = self.files.lock();
        let descriptor = files.get_mut(fd).ok_or_else(bad_fd)?;

        if descriptor.writer.is_none() {
            let (parent, zeroth_server, name) = (
                descriptor.parent,
                descriptor.zeroth_server,
                descriptor.name.clone(),
            );
            let handle = self.fetch_dir(parent, zeroth_server)?;
            let reply = self.call_entry_op(&handle, &name, || Request::WriteFile {
                dir_id: parent,
                name: name.clone(),
                data: data.to_vec(),
                offset,
            })?;
            let write = match reply {
                Reply::Write(write) => write,
                _ => return Err(unexpected_reply()),
            };
            if write.is_embedded {
                return Ok(());
            }
            // The write spilled the file (or it was already external):
            // replay the old embedded bytes, then our payload.
            let mut file = open_for_append(&write.link)?;
            if !write.data.is_empty() {
                file.write_all(&write.data)
                    .map_err(|e| FsError::Io(e.to_string()))?;
            }
            file.write_all(data).map_err(|e| FsError::Io(e.to_string()))?;
            let descriptor = files.get_mut(fd).ok_or_else(bad_fd)?;
            descriptor.writer = Some(file);
            return Ok(());
        }

        let writer = descriptor.writer.as_mut().ok_or_else(bad_fd)?;
        writer
            .write_all(data)
            .map_err(|e| FsError::Io(e.to_string()))?;
        Ok(())
    }

    /// Close a descriptor, flushing the backing file and letting the
    /// server refresh the entry attributes.
    pub fn close(&self, fd: usize) -> Result<(), FsError> {
        let mut descriptor = self.files.lock().take(fd).ok_or_else(bad_fd)?;
        if let Some(writer) = descriptor.writer.take() {
            let _ = writer.sync_all();
        }
        drop(descriptor.reader.take());

        let handle = self.fetch_dir(descriptor.parent, descriptor.zeroth_server)?;
        self.call_entry_op(&handle, &descriptor.name, || Request::CloseFile {
            dir_id: descriptor.parent,
            name: descriptor.name.clone(),
            mode: descriptor.mode,
        })?;
        Ok(())
    }
}

fn open_for_append(path: &str) -> Result<File, FsError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FsError::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> FileDescriptor {
        FileDescriptor {
            parent: 1,
            zeroth_server: 0,
            name: name.to_string(),
            mode: OPEN_READ | OPEN_WRITE,
            reader: None,
            writer: None,
        }
    }

    #[test]
    fn test_fd_table_alloc_reuses_slots() {
        let mut table = FdTable::new();
        let a = table.alloc(descriptor("a")).unwrap();
        let b = table.alloc(descriptor("b")).unwrap();
        assert_ne!(a, b);

        assert_eq!(table.take(a).unwrap().name, "a");
        let c = table.alloc(descriptor("c")).unwrap();
        // The freed slot is handed out again.
        assert_eq!(c, a);
    }

    #[test]
    fn test_fd_table_get_mut() {
        let mut table = FdTable::new();
        let fd = table.alloc(descriptor("x")).unwrap();
        table.get_mut(fd).unwrap().mode = OPEN_READ;
        assert_eq!(table.get_mut(fd).unwrap().mode, OPEN_READ);
        assert!(table.get_mut(fd + 1).is_none());
    }

    #[test]
    fn test_fd_table_take_twice() {
        let mut table = FdTable::new();
        let fd = table.alloc(descriptor("y")).unwrap();
        assert!(table.take(fd).is_some());
        assert!(table.take(fd).is_none());
    }
}
