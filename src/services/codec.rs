//! Split/merge codec.
//!
//! Splitting is purely size based: consecutive chunks of at most `size_limit`
//! bytes, written as `{base}_{ordinal:04}`. Merging recovers the order by
//! parsing the numeric suffix, never by directory listing order, so sets of
//! more than 9999 chunks still merge correctly.

use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

/// Minimum width of the zero-padded ordinal suffix.
pub const ORDINAL_WIDTH: usize = 4;

/// Stem of chunk files in local work directories. Work directories are
/// private to one upload or download, so chunk names never need the
/// original filename.
pub const WORK_CHUNK_STEM: &str = "part";

const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("size limit must be positive")]
    InvalidSizeLimit,
    #[error("chunk {ordinal} is missing")]
    MissingChunk { ordinal: u32 },
    #[error("chunk {ordinal} appears more than once")]
    DuplicateChunk { ordinal: u32 },
    #[error("`{0}` is not a chunk file")]
    UnrecognisedChunk(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A chunk written to disk by [`split`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkFile {
    pub ordinal: u32,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// File name of chunk `ordinal` of `base`.
pub fn chunk_file_name(base: &str, ordinal: u32) -> String {
    format!("{base}_{ordinal:0width$}", width = ORDINAL_WIDTH)
}

/// Parse the ordinal out of a chunk file name produced by [`chunk_file_name`].
pub fn parse_chunk_ordinal(file_name: &str) -> Option<u32> {
    let (_, suffix) = file_name.rsplit_once('_')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok().filter(|ordinal| *ordinal >= 1)
}

/// Split `source` into chunks of at most `size_limit` bytes inside `chunk_dir`.
///
/// An empty source yields a single empty chunk. On failure every chunk this
/// call created is removed before the error is returned.
pub async fn split(
    source: &Path,
    chunk_dir: &Path,
    base_name: &str,
    size_limit: u64,
) -> CodecResult<Vec<ChunkFile>> {
    if size_limit == 0 {
        return Err(CodecError::InvalidSizeLimit);
    }
    fs::create_dir_all(chunk_dir).await?;

    let mut chunks = Vec::new();
    match write_chunks(source, chunk_dir, base_name, size_limit, &mut chunks).await {
        Ok(()) => {
            debug!(
                "split {} into {} chunk(s) of at most {} bytes",
                source.display(),
                chunks.len(),
                size_limit
            );
            Ok(chunks)
        }
        Err(err) => {
            for chunk in &chunks {
                let _ = fs::remove_file(&chunk.path).await;
            }
            Err(err)
        }
    }
}

async fn write_chunks(
    source: &Path,
    chunk_dir: &Path,
    base_name: &str,
    size_limit: u64,
    chunks: &mut Vec<ChunkFile>,
) -> CodecResult<()> {
    let mut reader = File::open(source).await?;
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut current: Option<File> = None;

    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }

        let mut pending = &buf[..read];
        while !pending.is_empty() {
            let full = chunks
                .last()
                .is_none_or(|chunk| chunk.size_bytes >= size_limit);
            if current.is_none() || full {
                if let Some(file) = current.take() {
                    finish_chunk(file).await?;
                }
                current = Some(begin_chunk(chunk_dir, base_name, chunks).await?);
            }

            let (Some(file), Some(chunk)) = (current.as_mut(), chunks.last_mut()) else {
                return Err(io::Error::other("chunk writer not initialised").into());
            };
            let room = size_limit - chunk.size_bytes;
            let take = usize::try_from(room).map_or(pending.len(), |room| room.min(pending.len()));
            file.write_all(&pending[..take]).await?;
            chunk.size_bytes += take as u64;
            pending = &pending[take..];
        }
    }

    match current {
        Some(file) => finish_chunk(file).await?,
        None => {
            let file = begin_chunk(chunk_dir, base_name, chunks).await?;
            finish_chunk(file).await?;
        }
    }
    Ok(())
}

async fn begin_chunk(
    chunk_dir: &Path,
    base_name: &str,
    chunks: &mut Vec<ChunkFile>,
) -> CodecResult<File> {
    let ordinal = u32::try_from(chunks.len() + 1)
        .map_err(|_| io::Error::other("too many chunks"))?;
    let path = chunk_dir.join(chunk_file_name(base_name, ordinal));
    let file = File::create(&path).await?;
    chunks.push(ChunkFile {
        ordinal,
        path,
        size_bytes: 0,
    });
    Ok(file)
}

async fn finish_chunk(mut file: File) -> CodecResult<()> {
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Merge every chunk in `chunk_dir` into `output_dir/output_filename`.
///
/// The directory must hold exactly one contiguous chunk set `1..=n`.
pub async fn merge(
    chunk_dir: &Path,
    output_dir: &Path,
    output_filename: &str,
) -> CodecResult<PathBuf> {
    let mut found: BTreeMap<u32, PathBuf> = BTreeMap::new();
    let mut entries = fs::read_dir(chunk_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let ordinal =
            parse_chunk_ordinal(&name).ok_or_else(|| CodecError::UnrecognisedChunk(name.clone()))?;
        if found.insert(ordinal, entry.path()).is_some() {
            return Err(CodecError::DuplicateChunk { ordinal });
        }
    }

    let mut ordered = Vec::with_capacity(found.len());
    for (expected, (ordinal, path)) in (1u32..).zip(found) {
        if ordinal != expected {
            return Err(CodecError::MissingChunk { ordinal: expected });
        }
        ordered.push(path);
    }
    if ordered.is_empty() {
        return Err(CodecError::MissingChunk { ordinal: 1 });
    }

    let output = output_dir.join(output_filename);
    merge_ordered(&ordered, &output).await?;
    Ok(output)
}

/// Concatenate `chunks`, in the given order, into `output`.
///
/// Bytes go to a hidden temporary file beside `output` which is renamed into
/// place only after every chunk was copied and synced. Returns the number of
/// bytes written.
pub async fn merge_ordered(chunks: &[PathBuf], output: &Path) -> CodecResult<u64> {
    let parent = output
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "output path has no parent"))?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

    let written = match copy_all(chunks, &tmp_path).await {
        Ok(written) => written,
        Err(err) => {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
    };

    if let Err(err) = fs::rename(&tmp_path, output).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(output).await?;
            fs::rename(&tmp_path, output).await?;
        } else {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(CodecError::Io(err));
        }
    }

    debug!(
        "merged {} chunk(s) into {} ({} bytes)",
        chunks.len(),
        output.display(),
        written
    );
    Ok(written)
}

async fn copy_all(chunks: &[PathBuf], destination: &Path) -> CodecResult<u64> {
    let mut out = File::create(destination).await?;
    let mut written = 0u64;
    for chunk in chunks {
        let mut input = File::open(chunk).await?;
        written += tokio::io::copy(&mut input, &mut out).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    Ok(written)
}
