use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session {0:#010x} is bound to a different file")]
    PathConflict(u32),
    #[error("session {0:#010x} is bound to a different byte range")]
    RangeConflict(u32),
    #[error("unable to open file: {0}")]
    Open(#[source] io::Error),
}

/// Mutable half of a session, behind the per-session lock.
struct SessionIo {
    file: File,
    n_read: u64,
    refs: u32,
}

/// One ranged read of a single file, shared by every connection that joined
/// the same `(session_id, path, offset, n_requested)` tuple.
///
/// Invariants: `n_read <= n_requested`; `refs >= 1` while any handle is
/// live. A session whose `refs` dropped to 0 is dead, and its registry slot
/// is reclaimed by a later insertion.
pub struct FileSession {
    session_id: u32,
    path: PathBuf,
    offset: u64,
    n_requested: u64,
    io: Mutex<SessionIo>,
}

impl FileSession {
    fn open(
        session_id: u32,
        path: &Path,
        offset: u64,
        n_requested: u64,
    ) -> Result<Self, SessionError> {
        let mut file = File::open(path).map_err(SessionError::Open)?;
        file.seek(SeekFrom::Start(offset)).map_err(SessionError::Open)?;
        Ok(Self {
            session_id,
            path: path.to_path_buf(),
            offset,
            n_requested,
            io: Mutex::new(SessionIo { file, n_read: 0, refs: 1 }),
        })
    }
}

/// Snapshot framing one retrieval chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkMeta {
    pub session_id: u32,
    /// Absolute file offset of the chunk's first byte.
    pub offset: u64,
    pub len: usize,
}

/// Claim on a live session; dropping it releases the reference. The slot is
/// recovered lazily by the next insertion, not on release.
pub struct SessionHandle {
    session: Arc<FileSession>,
}

impl SessionHandle {
    /// Reads the next chunk into `dst` under the session lock, never past
    /// the requested range. Concurrent handles share the cursor and so
    /// partition the range between them.
    pub fn advance(&self, dst: &mut [u8]) -> io::Result<ChunkMeta> {
        let session = &*self.session;
        let mut io = session.io.lock().unwrap();
        let remaining = session.n_requested - io.n_read;
        let max = (dst.len() as u64).min(remaining) as usize;
        let offset = session.offset + io.n_read;
        let len = io.file.read(&mut dst[..max])?;
        io.n_read += len as u64;
        Ok(ChunkMeta { session_id: session.session_id, offset, len })
    }

    /// True once every requested byte has been handed out.
    pub fn drained(&self) -> bool {
        let io = self.session.io.lock().unwrap();
        io.n_read == self.session.n_requested
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.session.io.lock().unwrap().refs -= 1;
    }
}

/// Shared table of open file sessions.
///
/// Locking is two-level: the registry mutex guards the slot vector, each
/// session's mutex guards its cursor and refcount. Registry first, session
/// second, never the reverse.
pub struct SessionRegistry {
    slots: Mutex<Vec<Arc<FileSession>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { slots: Mutex::new(Vec::with_capacity(10)) }
    }

    /// Opens a new session, or joins an existing live one carrying the
    /// identical `(session_id, path, offset, n_requested)` tuple. A live
    /// session with the same id but a different file or range is a conflict.
    pub fn open_or_join(
        &self,
        session_id: u32,
        path: &Path,
        offset: u64,
        n_requested: u64,
    ) -> Result<SessionHandle, SessionError> {
        let mut slots = self.slots.lock().unwrap();

        let mut reuse = None;
        for (i, session) in slots.iter().enumerate() {
            let mut io = session.io.lock().unwrap();
            if io.refs == 0 {
                if reuse.is_none() {
                    reuse = Some(i);
                }
                continue;
            }
            if session.session_id != session_id {
                continue;
            }
            if session.path != path {
                return Err(SessionError::PathConflict(session_id));
            }
            if session.offset != offset || session.n_requested != n_requested {
                return Err(SessionError::RangeConflict(session_id));
            }
            // multiplex: join the live session
            io.refs += 1;
            drop(io);
            return Ok(SessionHandle { session: Arc::clone(session) });
        }

        let session = Arc::new(FileSession::open(session_id, path, offset, n_requested)?);
        let handle = SessionHandle { session: Arc::clone(&session) };
        match reuse {
            Some(i) => slots[i] = session,
            None => slots.push(session),
        }
        Ok(handle)
    }

    /// Number of slots currently allocated, dead or alive.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
