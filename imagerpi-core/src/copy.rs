//! Byte-range copies between block devices and image files.
//!
//! Both capture and deploy reduce to the same operation: copy `[0, len)` from
//! one seekable stream to another in fixed-size chunks, then optionally
//! compare the two ranges by hash.
use crate::error::{ImageError, Result};
use crate::platform;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Copies the first `len` bytes of `src` into `dest`.
///
/// Data moves in chunks of `buffer_size` bytes; the final chunk is clipped
/// to what remains. `on_progress` receives `(bytes_done, len)` after every
/// chunk. Both streams are rewound to offset 0 first.
///
/// # Errors
///
/// - [`ImageError::InvalidSize`] if `buffer_size` is zero.
/// - [`ImageError::ShortRead`] if `src` ends before `len` bytes.
/// - [`ImageError::ShortWrite`] if `dest` stops accepting data.
/// - [`ImageError::Io`] for any other I/O failure.
pub fn copy<R, W, F>(
    src: &mut R,
    dest: &mut W,
    len: u64,
    buffer_size: u64,
    mut on_progress: F,
) -> Result<u64>
where
    R: Read + Seek,
    W: Write + Seek,
    F: FnMut(u64, u64),
{
    if buffer_size == 0 {
        return Err(ImageError::InvalidSize("0B".to_string()));
    }

    src.seek(SeekFrom::Start(0))?;
    dest.seek(SeekFrom::Start(0))?;

    let chunk_size = buffer_size.min(len).max(1) as usize;
    let mut buffer = vec![0u8; chunk_size];

    let mut copied: u64 = 0;
    while copied < len {
        let to_read = std::cmp::min(buffer_size, len - copied) as usize;
        let chunk = &mut buffer[..to_read];

        let filled = read_full(src, chunk)?;
        if filled < to_read {
            return Err(ImageError::ShortRead {
                offset: copied + filled as u64,
                missing: len - copied - filled as u64,
            });
        }

        dest.write_all(chunk).map_err(|e| match e.kind() {
            io::ErrorKind::WriteZero => ImageError::ShortWrite { offset: copied },
            _ => ImageError::Io(e),
        })?;

        copied += to_read as u64;
        on_progress(copied, len);
    }

    dest.flush()?;
    Ok(copied)
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Opens `src_path` and `dest_path`, copies `[0, len)` and closes both.
///
/// A block-device destination is written in place; any other destination
/// is created or truncated first. The destination is synced to storage
/// before returning.
pub fn copy_path<F>(
    src_path: &Path,
    dest_path: &Path,
    len: u64,
    buffer_size: u64,
    on_progress: F,
) -> Result<u64>
where
    F: FnMut(u64, u64),
{
    debug!("opening {}", src_path.display());
    let mut src = File::open(src_path)?;

    debug!("opening {}", dest_path.display());
    let is_device = platform::is_block_device(dest_path);
    let mut dest = OpenOptions::new()
        .write(true)
        .create(!is_device)
        .truncate(!is_device)
        .open(dest_path)?;

    let copied = copy(&mut src, &mut dest, len, buffer_size, on_progress)?;
    dest.sync_all()?;

    debug!("closing {} and {}", src_path.display(), dest_path.display());
    Ok(copied)
}

/// Hashes the first `len` bytes of a stream with SHA-256.
fn hash_range<R, F>(src: &mut R, len: u64, buffer_size: u64, mut on_progress: F) -> Result<Vec<u8>>
where
    R: Read + Seek,
    F: FnMut(u64),
{
    src.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; buffer_size.min(len).max(1) as usize];

    let mut done: u64 = 0;
    while done < len {
        let chunk = std::cmp::min(buffer.len() as u64, len - done) as usize;
        let filled = read_full(src, &mut buffer[..chunk])?;
        if filled < chunk {
            return Err(ImageError::ShortRead {
                offset: done + filled as u64,
                missing: len - done - filled as u64,
            });
        }
        hasher.update(&buffer[..chunk]);
        done += chunk as u64;
        on_progress(done);
    }

    Ok(hasher.finalize().to_vec())
}

/// Checks that `[0, len)` is identical in `src_path` and `dest_path`.
///
/// `on_progress` receives `(bytes_hashed, 2 * len)` as both sides are read
/// in turn.
///
/// # Errors
///
/// [`ImageError::VerificationFailed`] if the hashes differ, or the errors of
/// [`copy`] if either side cannot be read in full.
pub fn verify_path<F>(
    src_path: &Path,
    dest_path: &Path,
    len: u64,
    buffer_size: u64,
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(u64, u64),
{
    if buffer_size == 0 {
        return Err(ImageError::InvalidSize("0B".to_string()));
    }
    let total = len * 2;

    let mut src = File::open(src_path)?;
    let src_hash = hash_range(&mut src, len, buffer_size, |done| on_progress(done, total))?;
    drop(src);

    let mut dest = File::open(dest_path)?;
    let dest_hash = hash_range(&mut dest, len, buffer_size, |done| {
        on_progress(len + done, total)
    })?;

    if src_hash != dest_hash {
        return Err(ImageError::VerificationFailed {
            src: src_path.to_path_buf(),
            dest: dest_path.to_path_buf(),
            len,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn copies_exact_prefix_for_awkward_sizes() {
        let data = pattern(10_000);
        for (len, buffer) in [
            (0u64, 512u64),
            (1, 512),
            (100, 512),
            (512, 512),
            (4096, 512),
            (4097, 512),
            (9_999, 1000),
            (10_000, 3),
            (10_000, 1_000_000),
        ] {
            let mut src = Cursor::new(data.clone());
            let mut dest = Cursor::new(Vec::new());
            let copied = copy(&mut src, &mut dest, len, buffer, |_, _| {}).unwrap();
            assert_eq!(copied, len);
            assert_eq!(dest.into_inner(), &data[..len as usize], "len={len} buffer={buffer}");
        }
    }

    #[test]
    fn reports_progress_per_chunk() {
        let mut src = Cursor::new(pattern(2500));
        let mut dest = Cursor::new(Vec::new());
        let mut seen = Vec::new();
        copy(&mut src, &mut dest, 2500, 1000, |done, total| seen.push((done, total))).unwrap();
        assert_eq!(seen, vec![(1000, 2500), (2000, 2500), (2500, 2500)]);
    }

    #[test]
    fn short_source_is_short_read() {
        let mut src = Cursor::new(pattern(700));
        let mut dest = Cursor::new(Vec::new());
        let err = copy(&mut src, &mut dest, 1000, 512, |_, _| {}).unwrap_err();
        assert!(matches!(
            err,
            ImageError::ShortRead {
                offset: 700,
                missing: 300
            }
        ));
    }

    #[test]
    fn full_destination_is_short_write() {
        let mut src = Cursor::new(pattern(1000));
        let mut backing = [0u8; 600];
        let mut dest = Cursor::new(&mut backing[..]);
        let err = copy(&mut src, &mut dest, 1000, 512, |_, _| {}).unwrap_err();
        assert!(matches!(err, ImageError::ShortWrite { offset: 512 }));
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let mut src = Cursor::new(pattern(10));
        let mut dest = Cursor::new(Vec::new());
        assert!(matches!(
            copy(&mut src, &mut dest, 10, 0, |_, _| {}),
            Err(ImageError::InvalidSize(_))
        ));
    }

    #[test]
    fn copy_path_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("disk.raw");
        let dest = dir.path().join("image.img");
        std::fs::write(&src, pattern(5000)).unwrap();
        std::fs::write(&dest, vec![0xffu8; 9000]).unwrap();

        let copied = copy_path(&src, &dest, 4000, 1024, |_, _| {}).unwrap();

        assert_eq!(copied, 4000);
        assert_eq!(std::fs::read(&dest).unwrap(), &pattern(5000)[..4000]);
    }

    #[test]
    fn verify_detects_difference() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let mut data = pattern(3000);
        std::fs::write(&a, &data).unwrap();
        data.extend_from_slice(b"trailing bytes past the range are ignored");
        std::fs::write(&b, &data).unwrap();

        let mut last = (0, 0);
        verify_path(&a, &b, 3000, 1000, |done, total| last = (done, total)).unwrap();
        assert_eq!(last, (6000, 6000));

        data[1500] ^= 0xff;
        std::fs::write(&b, &data).unwrap();
        assert!(matches!(
            verify_path(&a, &b, 3000, 1000, |_, _| {}),
            Err(ImageError::VerificationFailed { .. })
        ));
    }
}
