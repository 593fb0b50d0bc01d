use std::{
    borrow::Cow,
    ffi::OsString,
    fs, io,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
};

use silo_codec::{CodecError, Dictionary, compress, decompress};
use silo_proto::{METADATA_SIZE, RequestHeader, RequestKind, ResponseFrame, ResponseKind, write_metadata};
use tracing::debug;

use crate::sessions::{SessionHandle, SessionRegistry};

/// Total size of one retrieval write buffer, metadata and prefix included.
const RET_FILE_BUF: usize = 512;
/// Session id (4) + chunk offset (8) + chunk length (8).
const CHUNK_PREFIX: usize = 20;

pub(crate) struct HandlerCtx<'a> {
    pub dir: &'a Path,
    pub dict: &'a Dictionary,
    pub sessions: &'a SessionRegistry,
}

/// Routes a completed request to its handler. Handlers are total: every
/// request yields a fully prepared response frame, malformed ones an error
/// frame. `Shutdown` is intercepted by the reactor before this point.
pub(crate) fn dispatch(
    ctx: &HandlerCtx,
    header: RequestHeader,
    payload: &[u8],
) -> (ResponseFrame, Option<SessionHandle>) {
    match header.kind {
        Some(RequestKind::Echo) => (echo(ctx.dict, header, payload), None),
        Some(RequestKind::ListDir) => (list_dir(ctx, header, payload), None),
        Some(RequestKind::FileSize) => (file_size(ctx, header, payload), None),
        Some(RequestKind::RetFile) => ret_file(ctx, header, payload),
        Some(RequestKind::Shutdown) | None => (ResponseFrame::error(), None),
    }
}

/// Sends the payload back. A plain payload is compressed when the client
/// asked for that; anything else is copied through with its compression bit
/// preserved.
fn echo(dict: &Dictionary, header: RequestHeader, payload: &[u8]) -> ResponseFrame {
    if !header.payload_compressed && header.wants_compressed {
        respond(dict, ResponseKind::Echo, true, payload)
    } else {
        ResponseFrame::from_body(ResponseKind::Echo, header.payload_compressed, payload)
    }
}

/// Lists the regular files of the serving directory as NUL-terminated names.
/// The request payload must be empty.
fn list_dir(ctx: &HandlerCtx, header: RequestHeader, payload: &[u8]) -> ResponseFrame {
    if !payload.is_empty() {
        return ResponseFrame::error();
    }
    let Ok(entries) = fs::read_dir(ctx.dir) else {
        return ResponseFrame::error();
    };

    let mut body = Vec::with_capacity(64);
    for entry in entries.flatten() {
        let regular = fs::metadata(entry.path()).is_ok_and(|m| m.is_file());
        if !regular {
            continue;
        }
        body.extend_from_slice(entry.file_name().as_bytes());
        body.push(0);
    }
    respond(ctx.dict, ResponseKind::ListDir, header.wants_compressed, &body)
}

/// Answers with the target file's size as 8 big-endian bytes.
fn file_size(ctx: &HandlerCtx, header: RequestHeader, payload: &[u8]) -> ResponseFrame {
    let Ok(name) = inbound(ctx.dict, header, payload) else {
        return ResponseFrame::error();
    };
    let Ok(meta) = fs::metadata(join_under(ctx.dir, &name)) else {
        return ResponseFrame::error();
    };
    respond(ctx.dict, ResponseKind::FileSize, header.wants_compressed, &meta.len().to_be_bytes())
}

/// Opens (or joins) a retrieval session and prepares the first chunk.
///
/// Payload layout after any inbound decompression: 4 bytes of opaque session
/// id, 8 bytes big-endian offset, 8 bytes big-endian length, then the file
/// name. An empty name, a short payload, an out-of-range request, or a
/// registry conflict all yield an error frame.
fn ret_file(
    ctx: &HandlerCtx,
    header: RequestHeader,
    payload: &[u8],
) -> (ResponseFrame, Option<SessionHandle>) {
    let Ok(payload) = inbound(ctx.dict, header, payload) else {
        return (ResponseFrame::error(), None);
    };
    if payload.len() <= CHUNK_PREFIX {
        return (ResponseFrame::error(), None);
    }
    let session_id = u32::from_le_bytes(payload[..4].try_into().unwrap());
    let offset = u64::from_be_bytes(payload[4..12].try_into().unwrap());
    let n_requested = u64::from_be_bytes(payload[12..CHUNK_PREFIX].try_into().unwrap());
    let path = join_under(ctx.dir, &payload[CHUNK_PREFIX..]);

    let Some(end) = offset.checked_add(n_requested) else {
        return (ResponseFrame::error(), None);
    };
    match fs::metadata(&path) {
        Ok(meta) if meta.len() >= end => {}
        _ => return (ResponseFrame::error(), None),
    }

    let handle = match ctx.sessions.open_or_join(session_id, &path, offset, n_requested) {
        Ok(handle) => handle,
        Err(err) => {
            debug!(?err, "retrieval rejected");
            return (ResponseFrame::error(), None);
        }
    };
    match fill_chunk(ctx.dict, &handle, header.wants_compressed) {
        Ok(buf) => (ResponseFrame::from_raw(ResponseKind::RetFile, buf), Some(handle)),
        Err(err) => {
            debug!(?err, "initial chunk read failed");
            (ResponseFrame::error(), None)
        }
    }
}

/// Builds the next retrieval buffer from the session cursor: 9 bytes of
/// metadata, the 20-byte chunk prefix, then the file bytes, optionally
/// compressed as a whole body.
pub(crate) fn fill_chunk(
    dict: &Dictionary,
    handle: &SessionHandle,
    compress_out: bool,
) -> io::Result<Vec<u8>> {
    let mut body = vec![0; RET_FILE_BUF - METADATA_SIZE];
    let meta = handle.advance(&mut body[CHUNK_PREFIX..])?;
    if meta.len == 0 && !handle.drained() {
        // the file shrank under a live session
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "retrieval cursor stalled"));
    }
    body.truncate(CHUNK_PREFIX + meta.len);
    body[..4].copy_from_slice(&meta.session_id.to_le_bytes());
    body[4..12].copy_from_slice(&meta.offset.to_be_bytes());
    body[12..CHUNK_PREFIX].copy_from_slice(&(meta.len as u64).to_be_bytes());

    if compress_out {
        let mut buf = compress(dict, &body, METADATA_SIZE);
        let len = (buf.len() - METADATA_SIZE) as u64;
        write_metadata(&mut buf, ResponseKind::RetFile, true, len);
        Ok(buf)
    } else {
        let mut buf = vec![0; METADATA_SIZE];
        buf.extend_from_slice(&body);
        write_metadata(&mut buf, ResponseKind::RetFile, false, body.len() as u64);
        Ok(buf)
    }
}

/// Decompresses the payload when the client flagged it compressed.
fn inbound<'a>(
    dict: &Dictionary,
    header: RequestHeader,
    payload: &'a [u8],
) -> Result<Cow<'a, [u8]>, CodecError> {
    if header.payload_compressed {
        decompress(dict, payload).map(Cow::Owned)
    } else {
        Ok(Cow::Borrowed(payload))
    }
}

/// Body framing shared by the simple handlers: compressed output when asked
/// for, a plain copy otherwise.
fn respond(dict: &Dictionary, kind: ResponseKind, wants_compressed: bool, body: &[u8]) -> ResponseFrame {
    if wants_compressed {
        let mut buf = compress(dict, body, METADATA_SIZE);
        let len = (buf.len() - METADATA_SIZE) as u64;
        write_metadata(&mut buf, kind, true, len);
        ResponseFrame::from_raw(kind, buf)
    } else {
        ResponseFrame::from_body(kind, false, body)
    }
}

/// `<dir>/<name>` by byte concatenation, the only path handling the protocol
/// promises.
fn join_under(dir: &Path, name: &[u8]) -> PathBuf {
    let mut raw = dir.as_os_str().as_bytes().to_vec();
    raw.push(b'/');
    raw.extend_from_slice(name);
    PathBuf::from(OsString::from_vec(raw))
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use silo_proto::Drive;
    use tempfile::TempDir;

    use super::*;

    /// Every symbol codes to its own 8-bit value.
    fn identity_dict() -> Dictionary {
        let mut blob = Vec::with_capacity(512);
        for symbol in 0..=255u8 {
            blob.push(8);
            blob.push(symbol);
        }
        Dictionary::parse(&blob).unwrap()
    }

    /// Drains a frame through a plain sink, yielding the wire bytes.
    fn wire(mut frame: ResponseFrame) -> Vec<u8> {
        let mut sink = Vec::new();
        assert_eq!(frame.drive(&mut sink), Drive::Complete);
        sink
    }

    fn body_len(wire: &[u8]) -> u64 {
        u64::from_be_bytes(wire[1..METADATA_SIZE].try_into().unwrap())
    }

    fn header(byte: u8) -> RequestHeader {
        RequestHeader::parse(byte)
    }

    struct Fixture {
        dir: TempDir,
        dict: Dictionary,
        sessions: SessionRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self { dir: tempfile::tempdir().unwrap(), dict: identity_dict(), sessions: SessionRegistry::new() }
        }

        fn ctx(&self) -> HandlerCtx<'_> {
            HandlerCtx { dir: self.dir.path(), dict: &self.dict, sessions: &self.sessions }
        }

        fn file(&self, name: &str, bytes: &[u8]) {
            File::create(self.dir.path().join(name)).unwrap().write_all(bytes).unwrap();
        }
    }

    fn ret_payload(session: [u8; 4], offset: u64, len: u64, name: &[u8]) -> Vec<u8> {
        let mut payload = session.to_vec();
        payload.extend_from_slice(&offset.to_be_bytes());
        payload.extend_from_slice(&len.to_be_bytes());
        payload.extend_from_slice(name);
        payload
    }

    #[test]
    fn echo_plain_round_trip() {
        let fx = Fixture::new();
        let (frame, session) = dispatch(&fx.ctx(), header(0x00), b"hello");
        assert!(session.is_none());
        assert_eq!(wire(frame), [&[0x10, 0, 0, 0, 0, 0, 0, 0, 5][..], b"hello"].concat());
    }

    #[test]
    fn echo_compresses_on_request() {
        let fx = Fixture::new();
        let (frame, _) = dispatch(&fx.ctx(), header(0x04), b"hello");
        let wire = wire(frame);
        assert_eq!(wire[0], 0x18);
        assert_eq!(body_len(&wire) as usize, wire.len() - METADATA_SIZE);
        assert_eq!(decompress(&fx.dict, &wire[METADATA_SIZE..]).unwrap(), b"hello");
    }

    #[test]
    fn echo_passes_compressed_payloads_through() {
        let fx = Fixture::new();
        let packed = compress(&fx.dict, b"hello", 0);
        let (frame, _) = dispatch(&fx.ctx(), header(0x0C), &packed);
        let wire = wire(frame);
        assert_eq!(wire[0], 0x18);
        assert_eq!(&wire[METADATA_SIZE..], &packed[..]);
    }

    #[test]
    fn list_dir_names_regular_files_only() {
        let fx = Fixture::new();
        fx.file("a.bin", b"x");
        fx.file("b.txt", b"y");
        fs::create_dir(fx.dir.path().join("sub")).unwrap();

        let (frame, _) = dispatch(&fx.ctx(), header(0x20), b"");
        let wire = wire(frame);
        assert_eq!(wire[0], 0x30);
        let body = &wire[METADATA_SIZE..];
        assert_eq!(*body.last().unwrap(), 0);
        let mut names: Vec<&[u8]> = body.split(|&b| b == 0).filter(|s| !s.is_empty()).collect();
        names.sort_unstable();
        assert_eq!(names, [&b"a.bin"[..], b"b.txt"]);
    }

    #[test]
    fn list_dir_rejects_a_payload() {
        let fx = Fixture::new();
        let (frame, _) = dispatch(&fx.ctx(), header(0x20), b"x");
        assert_eq!(wire(frame), [0xF0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn file_size_is_big_endian() {
        let fx = Fixture::new();
        fx.file("a.bin", &[7; 1000]);
        let (frame, _) = dispatch(&fx.ctx(), header(0x40), b"a.bin");
        let wire = wire(frame);
        assert_eq!(wire[0], 0x50);
        assert_eq!(body_len(&wire), 8);
        assert_eq!(&wire[METADATA_SIZE..], &[0, 0, 0, 0, 0, 0, 0x03, 0xE8]);
    }

    #[test]
    fn file_size_accepts_a_compressed_name() {
        let fx = Fixture::new();
        fx.file("a.bin", &[7; 1000]);
        let packed = compress(&fx.dict, b"a.bin", 0);
        let (frame, _) = dispatch(&fx.ctx(), header(0x48), &packed);
        let wire = wire(frame);
        assert_eq!(wire[0], 0x50);
        assert_eq!(&wire[METADATA_SIZE..], &[0, 0, 0, 0, 0, 0, 0x03, 0xE8]);
    }

    #[test]
    fn file_size_unknown_file_errors() {
        let fx = Fixture::new();
        let (frame, _) = dispatch(&fx.ctx(), header(0x40), b"nope.bin");
        assert_eq!(wire(frame)[0], 0xF0);
    }

    #[test]
    fn malformed_compressed_payload_errors() {
        let fx = Fixture::new();
        let (frame, _) = dispatch(&fx.ctx(), header(0x48), b"");
        assert_eq!(wire(frame)[0], 0xF0);
    }

    #[test]
    fn unknown_request_type_errors() {
        let fx = Fixture::new();
        let (frame, _) = dispatch(&fx.ctx(), header(0xA0), b"");
        assert_eq!(wire(frame), [0xF0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn ret_file_single_chunk_coverage() {
        let fx = Fixture::new();
        let bytes: Vec<u8> = (0..10).collect();
        fx.file("a.bin", &bytes);

        let payload = ret_payload([0x11, 0x22, 0x33, 0x44], 0, 10, b"a.bin");
        let (frame, session) = dispatch(&fx.ctx(), header(0x60), &payload);
        let handle = session.expect("retrieval carries a session");
        assert!(handle.drained());

        let wire = wire(frame);
        assert_eq!(wire[0], 0x70);
        assert_eq!(body_len(&wire), 30);
        let body = &wire[METADATA_SIZE..];
        // the session id is echoed verbatim
        assert_eq!(&body[..4], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(u64::from_be_bytes(body[4..12].try_into().unwrap()), 0);
        assert_eq!(u64::from_be_bytes(body[12..20].try_into().unwrap()), 10);
        assert_eq!(&body[20..], &bytes[..]);
    }

    #[test]
    fn ret_file_streams_across_chunks() {
        let fx = Fixture::new();
        let bytes: Vec<u8> = (0..1000u64).map(|i| (i % 251) as u8).collect();
        fx.file("big.bin", &bytes);

        let payload = ret_payload([9, 9, 9, 9], 100, 800, b"big.bin");
        let (frame, session) = dispatch(&fx.ctx(), header(0x60), &payload);
        let handle = session.unwrap();

        let mut collected = Vec::new();
        let mut expect_offset = 100;
        let mut buf = wire(frame);
        loop {
            let body = &buf[METADATA_SIZE..];
            assert_eq!(u64::from_be_bytes(body[4..12].try_into().unwrap()), expect_offset);
            let chunk_len = u64::from_be_bytes(body[12..20].try_into().unwrap()) as usize;
            assert_eq!(body.len(), 20 + chunk_len);
            collected.extend_from_slice(&body[20..]);
            expect_offset += chunk_len as u64;
            if handle.drained() {
                break;
            }
            buf = fill_chunk(&fx.dict, &handle, false).unwrap();
        }
        assert_eq!(collected, bytes[100..900]);
    }

    #[test]
    fn ret_file_compressed_chunks_decode() {
        let fx = Fixture::new();
        fx.file("a.bin", b"abcdefgh");
        let payload = ret_payload([1, 0, 0, 0], 2, 4, b"a.bin");
        let (frame, _session) = dispatch(&fx.ctx(), header(0x64), &payload);
        let wire = wire(frame);
        assert_eq!(wire[0], 0x78);
        let body = decompress(&fx.dict, &wire[METADATA_SIZE..]).unwrap();
        assert_eq!(u64::from_be_bytes(body[4..12].try_into().unwrap()), 2);
        assert_eq!(u64::from_be_bytes(body[12..20].try_into().unwrap()), 4);
        assert_eq!(&body[20..], b"cdef");
    }

    #[test]
    fn ret_file_out_of_range_errors() {
        let fx = Fixture::new();
        fx.file("a.bin", &[0; 10]);
        let payload = ret_payload([1, 0, 0, 0], 5, 6, b"a.bin");
        let (frame, session) = dispatch(&fx.ctx(), header(0x60), &payload);
        assert!(session.is_none());
        assert_eq!(wire(frame), [0xF0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn ret_file_overflowing_range_errors() {
        let fx = Fixture::new();
        fx.file("a.bin", &[0; 10]);
        let payload = ret_payload([1, 0, 0, 0], u64::MAX, 2, b"a.bin");
        let (frame, _) = dispatch(&fx.ctx(), header(0x60), &payload);
        assert_eq!(wire(frame)[0], 0xF0);
    }

    #[test]
    fn ret_file_empty_name_errors() {
        let fx = Fixture::new();
        for payload in [ret_payload([1, 0, 0, 0], 0, 1, b""), b"shrt".to_vec()] {
            let (frame, session) = dispatch(&fx.ctx(), header(0x60), &payload);
            assert!(session.is_none());
            assert_eq!(wire(frame)[0], 0xF0);
        }
    }

    #[test]
    fn ret_file_session_conflict_leaves_the_first_intact() {
        let fx = Fixture::new();
        let bytes: Vec<u8> = (0..100).collect();
        fx.file("a.bin", &bytes);
        fx.file("b.bin", &bytes);

        let first = ret_payload([5, 0, 0, 0], 0, 100, b"a.bin");
        let (frame, session) = dispatch(&fx.ctx(), header(0x60), &first);
        let handle = session.unwrap();
        let first_wire = wire(frame);

        let conflict = ret_payload([5, 0, 0, 0], 0, 100, b"b.bin");
        let (frame, session) = dispatch(&fx.ctx(), header(0x60), &conflict);
        assert!(session.is_none());
        assert_eq!(wire(frame)[0], 0xF0);

        // the original session still drains to completion
        let mut collected = first_wire[METADATA_SIZE + 20..].to_vec();
        while !handle.drained() {
            let buf = fill_chunk(&fx.dict, &handle, false).unwrap();
            collected.extend_from_slice(&buf[METADATA_SIZE + 20..]);
        }
        assert_eq!(collected, bytes);
    }
}
