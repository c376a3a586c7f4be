//! Reading managed process logs: tail and follow.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::core::errors::{CfhError, Result};

const CHUNK: u64 = 8 * 1024;

/// Last `n` lines of `path` plus the file length they were read at.
///
/// Reads backwards in fixed chunks so large logs are not loaded whole.
pub fn tail_lines(path: &Path, n: usize) -> Result<(Vec<String>, u64)> {
    let mut file = File::open(path).map_err(|err| CfhError::io(path, err))?;
    let len = file
        .metadata()
        .map_err(|err| CfhError::io(path, err))?
        .len();
    if n == 0 || len == 0 {
        return Ok((Vec::new(), len));
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut pos = len;
    let start = loop {
        let read = CHUNK.min(pos);
        pos -= read;
        let mut chunk = vec![0u8; usize::try_from(read).unwrap_or(usize::MAX)];
        file.seek(SeekFrom::Start(pos))
            .and_then(|_| file.read_exact(&mut chunk))
            .map_err(|err| CfhError::io(path, err))?;
        chunk.extend_from_slice(&buf);
        buf = chunk;

        // A trailing newline terminates the last line rather than starting a new one.
        let search_end = buf.len() - usize::from(buf.last() == Some(&b'\n'));
        if let Some(idx) = memchr::memrchr_iter(b'\n', &buf[..search_end]).nth(n - 1) {
            break idx + 1;
        }
        if pos == 0 {
            break 0;
        }
    };

    let text = String::from_utf8_lossy(&buf[start..]);
    let lines = text.lines().map(str::to_string).collect();
    Ok((lines, len))
}

/// Copy data appended to `path` after `offset` into `out` until `stop` is set.
///
/// A file that shrinks below the read position was truncated or rotated and is
/// read again from the start.
pub fn follow(
    path: &Path,
    mut offset: u64,
    poll: Duration,
    stop: &AtomicBool,
    out: &mut impl Write,
) -> Result<()> {
    let mut buf = vec![0u8; usize::try_from(CHUNK).unwrap_or(8192)];
    while !stop.load(Ordering::Relaxed) {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                thread::sleep(poll);
                continue;
            }
            Err(err) => return Err(CfhError::io(path, err)),
        };
        let len = file
            .metadata()
            .map_err(|err| CfhError::io(path, err))?
            .len();
        if len < offset {
            tracing::debug!(path = %path.display(), "log truncated, restarting from the top");
            offset = 0;
        }
        if len > offset {
            file.seek(SeekFrom::Start(offset))
                .map_err(|err| CfhError::io(path, err))?;
            loop {
                let read = file.read(&mut buf).map_err(|err| CfhError::io(path, err))?;
                if read == 0 {
                    break;
                }
                out.write_all(&buf[..read])
                    .and_then(|()| out.flush())
                    .map_err(|err| CfhError::io("<stdout>", err))?;
                offset += read as u64;
            }
        }
        thread::sleep(poll);
    }
    Ok(())
}
