//! Verified, resumable local copy.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ferry_hasher::{HashAlgorithm, hash_file};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{COPY_CHUNK_SIZE, WorkerError};

/// Staging file a copy into `dst` is written to: `.<name>.part` beside it.
pub(crate) fn partial_path(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(".{name}.part"))
}

/// Copies `src` to the not-yet-existing `dst` through [`partial_path`],
/// then checks the staged size against `expected_len` and, when `verify`
/// is set, compares digests before renaming the stage onto `dst`.
///
/// A stage left by an interrupted earlier copy is resumed from its current
/// length. A read or write failure keeps the stage for the next attempt;
/// a failed size or digest check removes it. An existing `dst` is never
/// touched.
///
/// Returns the length of the finished target.
pub(crate) async fn copy_verified(
    src: &Path,
    dst: &Path,
    expected_len: u64,
    io_timeout: Duration,
    verify: Option<HashAlgorithm>,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<u64, WorkerError> {
    if let Some(parent) = dst.parent() {
        timeout(io_timeout, tokio::fs::create_dir_all(parent)).await??;
    }
    if timeout(io_timeout, tokio::fs::try_exists(dst)).await?? {
        return Err(WorkerError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists", dst.display()),
        )));
    }

    let stage = partial_path(dst);
    let offset = resume_offset(&stage, expected_len, io_timeout).await?;
    let mut reader = timeout(io_timeout, File::open(src)).await??;
    if offset > 0 {
        timeout(io_timeout, reader.seek(SeekFrom::Start(offset))).await??;
        info!(target_path = %dst.display(), offset, "resuming partial copy");
    }
    let writer = timeout(
        io_timeout,
        OpenOptions::new().create(true).append(true).open(&stage),
    )
    .await??;

    copy_chunks(reader, writer, offset, expected_len, io_timeout, &mut on_progress).await?;

    let checked = async {
        let actual = tokio::fs::metadata(&stage).await?.len();
        if actual != expected_len {
            return Err(WorkerError::SizeMismatch {
                expected: expected_len,
                actual,
            });
        }
        if let Some(algorithm) = verify {
            verify_digest(src, &stage, algorithm).await?;
        }
        Ok::<_, WorkerError>(())
    }
    .await;

    if let Err(e) = checked {
        debug!(target_path = %dst.display(), error = %e, "discarding staged copy");
        discard(&stage).await;
        return Err(e);
    }

    timeout(io_timeout, tokio::fs::rename(&stage, dst)).await??;
    Ok(expected_len)
}

/// Length of a usable stage, or 0. A stage longer than the source cannot
/// be a prefix of it and is dropped.
async fn resume_offset(stage: &Path, expected_len: u64, io_timeout: Duration) -> Result<u64, WorkerError> {
    match timeout(io_timeout, tokio::fs::metadata(stage)).await? {
        Ok(meta) if meta.is_file() && meta.len() <= expected_len => Ok(meta.len()),
        Ok(_) => {
            debug!(stage = %stage.display(), "stale stage larger than source, restarting");
            timeout(io_timeout, tokio::fs::remove_file(stage)).await??;
            Ok(0)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

async fn discard(stage: &Path) {
    if let Err(e) = tokio::fs::remove_file(stage).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(stage = %stage.display(), error = %e, "failed to remove staged copy");
    }
}

async fn copy_chunks(
    mut reader: File,
    mut writer: File,
    offset: u64,
    expected_len: u64,
    io_timeout: Duration,
    on_progress: &mut impl FnMut(u64, u64),
) -> Result<u64, WorkerError> {
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut copied = offset;
    on_progress(copied, expected_len);

    loop {
        let n = timeout(io_timeout, reader.read(&mut buf)).await??;
        if n == 0 {
            break;
        }
        timeout(io_timeout, writer.write_all(&buf[..n])).await??;
        copied += n as u64;
        on_progress(copied, expected_len);
    }

    timeout(io_timeout, writer.flush()).await??;
    timeout(io_timeout, writer.sync_all()).await??;
    Ok(copied)
}

async fn verify_digest(src: &Path, dst: &Path, algorithm: HashAlgorithm) -> Result<(), WorkerError> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    let (source_digest, target_digest) = tokio::task::spawn_blocking(move || {
        Ok::<_, ferry_hasher::HashError>((hash_file(&src, algorithm)?, hash_file(&dst, algorithm)?))
    })
    .await
    .map_err(|e| WorkerError::Io(std::io::Error::other(e)))??;

    if source_digest != target_digest {
        return Err(WorkerError::DigestMismatch {
            source_digest: source_digest.to_string(),
            target_digest: target_digest.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn copies_and_reports_progress() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("big.bin");
        let data: Vec<u8> = (0..(COPY_CHUNK_SIZE * 2 + 17)).map(|i| i as u8).collect();
        std::fs::write(&src, &data).unwrap();
        let dst = dir.path().join("out").join("nested").join("big.bin");

        let mut updates = Vec::new();
        let copied = copy_verified(
            &src,
            &dst,
            data.len() as u64,
            TIMEOUT,
            Some(HashAlgorithm::Sha256),
            |done, total| updates.push((done, total)),
        )
        .await
        .unwrap();

        assert_eq!(copied, data.len() as u64);
        assert_eq!(std::fs::read(&dst).unwrap(), data);
        assert_eq!(updates.first(), Some(&(0, data.len() as u64)));
        assert_eq!(updates.last(), Some(&(data.len() as u64, data.len() as u64)));
    }

    #[tokio::test]
    async fn size_mismatch_removes_partial_target() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.bin");
        std::fs::write(&src, b"12345").unwrap();
        let dst = dir.path().join("copy.bin");

        let err = copy_verified(&src, &dst, 99, TIMEOUT, None, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::SizeMismatch {
                expected: 99,
                actual: 5
            }
        ));
        assert!(!dst.exists());
        assert!(!partial_path(&dst).exists());
    }

    #[tokio::test]
    async fn existing_target_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.bin");
        let dst = dir.path().join("b.bin");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"old").unwrap();

        let err = copy_verified(&src, &dst, 3, TIMEOUT, None, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Io(e) if e.kind() == std::io::ErrorKind::AlreadyExists));
        assert_eq!(std::fs::read(&dst).unwrap(), b"old");
        assert!(!partial_path(&dst).exists());
    }

    #[tokio::test]
    async fn missing_source_fails_without_target() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("b.bin");
        let err = copy_verified(&dir.path().join("nope"), &dst, 0, TIMEOUT, None, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Io(_)));
        assert!(!dst.exists());
    }

    #[test]
    fn stage_sits_beside_target() {
        assert_eq!(
            partial_path(Path::new("/share/day1/a.jpg")),
            Path::new("/share/day1/.a.jpg.part")
        );
    }

    #[tokio::test]
    async fn resumes_from_interrupted_stage() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("big.bin");
        let data: Vec<u8> = (0..(COPY_CHUNK_SIZE * 2 + 300)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();
        let dst = dir.path().join("big.bin.copy");
        let already = COPY_CHUNK_SIZE + 100;
        std::fs::write(partial_path(&dst), &data[..already]).unwrap();

        let mut updates = Vec::new();
        let len = copy_verified(
            &src,
            &dst,
            data.len() as u64,
            TIMEOUT,
            Some(HashAlgorithm::Blake3),
            |done, total| updates.push((done, total)),
        )
        .await
        .unwrap();

        assert_eq!(len, data.len() as u64);
        assert_eq!(std::fs::read(&dst).unwrap(), data);
        assert!(!partial_path(&dst).exists());
        assert_eq!(updates.first(), Some(&(already as u64, data.len() as u64)));
        assert!(updates.iter().all(|(done, _)| *done >= already as u64));
    }

    #[tokio::test]
    async fn oversized_stage_restarts_copy() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.bin");
        std::fs::write(&src, b"short").unwrap();
        let dst = dir.path().join("b.bin");
        std::fs::write(partial_path(&dst), b"much longer leftover").unwrap();

        copy_verified(&src, &dst, 5, TIMEOUT, None, |_, _| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"short");
    }

    #[tokio::test]
    async fn corrupt_stage_fails_digest_and_is_dropped() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.bin");
        std::fs::write(&src, b"0123456789").unwrap();
        let dst = dir.path().join("b.bin");
        std::fs::write(partial_path(&dst), b"XXXX").unwrap();

        let err = copy_verified(&src, &dst, 10, TIMEOUT, Some(HashAlgorithm::Sha256), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::DigestMismatch { .. }));
        assert!(!dst.exists());
        assert!(!partial_path(&dst).exists());

        // The next attempt starts clean.
        copy_verified(&src, &dst, 10, TIMEOUT, Some(HashAlgorithm::Sha256), |_, _| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"0123456789");
    }
}
