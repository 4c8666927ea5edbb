//! Local filesystem storage.
//!
//! Layout under the store directory, with `xx` the first two characters of the
//! lowercase piece ID and `rest` the remainder:
//!
//! - `blobs/xx/rest.sj1`: V1 pieces (framed header, then payload)
//! - `blobs/xx/rest` and `blobs/xx/rest.hdr`: V0 pieces (payload, header)
//! - `trash/`: the same layout for trashed pieces
//! - `temp/`: uncommitted writes

use std::fs;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use piecestore_core::PieceId;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::header::{FormatVersion, PieceHeader, V1_HEADER_SIZE};
use crate::{PieceInfo, PieceReader, PieceWriter, Storage, StorageError};

const BLOBS_DIR: &str = "blobs";
const TRASH_DIR: &str = "trash";
const TEMP_DIR: &str = "temp";

const V1_EXTENSION: &str = "sj1";
const V0_HEADER_EXTENSION: &str = "hdr";

#[derive(Clone, Debug)]
pub struct LocalStorage {
    path: PathBuf,
}

impl LocalStorage {
    /// Open (or create) a store rooted at `store_dir`. Leftover uncommitted
    /// writes are removed.
    pub fn new<P: AsRef<Path>>(store_dir: P) -> Result<Self, StorageError> {
        let path = store_dir.as_ref().to_path_buf();
        for dir in [BLOBS_DIR, TRASH_DIR, TEMP_DIR] {
            fs::create_dir_all(path.join(dir))?;
        }

        for entry in fs::read_dir(path.join(TEMP_DIR))? {
            let entry = entry?;
            if let Err(err) = fs::remove_file(entry.path()) {
                warn!("Failed to remove stale temp file {}: {err}", entry.path().display());
            }
        }

        Ok(Self { path })
    }

    /// Get a reference to the path of the store.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn blobs(&self) -> PathBuf {
        self.path.join(BLOBS_DIR)
    }

    fn trash_dir(&self) -> PathBuf {
        self.path.join(TRASH_DIR)
    }
}

/// Files making up one piece.
#[derive(Clone, Debug)]
struct PiecePaths {
    payload: PathBuf,
    header: Option<PathBuf>,
    version: FormatVersion,
}

impl PiecePaths {
    fn new(base: &Path, piece_id: &PieceId, version: FormatVersion) -> Self {
        let encoded = piece_id.to_string().to_lowercase();
        let (prefix, rest) = encoded.split_at(2);
        let dir = base.join(prefix);
        match version {
            FormatVersion::V1 => Self {
                payload: dir.join(format!("{rest}.{V1_EXTENSION}")),
                header: None,
                version,
            },
            FormatVersion::V0 => Self {
                payload: dir.join(rest),
                header: Some(dir.join(format!("{rest}.{V0_HEADER_EXTENSION}"))),
                version,
            },
        }
    }

    fn payload_offset(&self) -> u64 {
        match self.version {
            FormatVersion::V1 => V1_HEADER_SIZE as u64,
            FormatVersion::V0 => 0,
        }
    }

    async fn read_header(&self) -> Result<PieceHeader, StorageError> {
        match &self.header {
            Some(header_path) => Ok(PieceHeader::decode(&tokio::fs::read(header_path).await?)?),
            None => {
                let mut file = File::open(&self.payload).await?;
                let mut region = vec![0u8; V1_HEADER_SIZE];
                file.read_exact(&mut region).await?;
                Ok(PieceHeader::decode_framed(&region)?)
            }
        }
    }

    async fn payload_size(&self) -> Result<u64, StorageError> {
        let len = tokio::fs::metadata(&self.payload).await?.len();
        len.checked_sub(self.payload_offset()).ok_or_else(|| {
            StorageError::ReadError(format!(
                "{} is shorter than its header",
                self.payload.display()
            ))
        })
    }

    async fn remove(&self) -> Result<(), StorageError> {
        tokio::fs::remove_file(&self.payload).await?;
        if let Some(header) = &self.header {
            remove_if_exists(header).await?;
        }
        Ok(())
    }

    async fn move_to(&self, target: &PiecePaths) -> Result<(), StorageError> {
        if let Some(parent) = target.payload.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let (Some(from), Some(to)) = (&self.header, &target.header) {
            tokio::fs::rename(from, to).await?;
        }
        tokio::fs::rename(&self.payload, &target.payload).await?;
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Find a piece under `base`, preferring the V1 layout.
async fn locate(base: &Path, piece_id: &PieceId) -> Result<Option<PiecePaths>, StorageError> {
    for version in [FormatVersion::V1, FormatVersion::V0] {
        let paths = PiecePaths::new(base, piece_id, version);
        if tokio::fs::try_exists(&paths.payload).await? {
            return Ok(Some(paths));
        }
    }
    Ok(None)
}

fn parse_file_name(prefix: &str, file_name: &str) -> Option<(PieceId, FormatVersion)> {
    let (rest, version) = match file_name.strip_suffix(&format!(".{V1_EXTENSION}")) {
        Some(rest) => (rest, FormatVersion::V1),
        None if file_name.contains('.') => return None,
        None => (file_name, FormatVersion::V0),
    };
    let encoded = format!("{prefix}{rest}").to_uppercase();
    PieceId::from_string(&encoded)
        .ok()
        .map(|piece_id| (piece_id, version))
}

/// Every piece stored under `base`.
async fn walk(base: &Path) -> Result<Vec<(PieceId, PiecePaths)>, StorageError> {
    let mut pieces = Vec::new();
    let mut prefixes = match tokio::fs::read_dir(base).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(pieces),
        Err(err) => return Err(err.into()),
    };

    while let Some(prefix_dir) = prefixes.next_entry().await? {
        if !prefix_dir.file_type().await?.is_dir() {
            continue;
        }
        let prefix = prefix_dir.file_name().to_string_lossy().into_owned();
        let mut files = tokio::fs::read_dir(prefix_dir.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let name = file.file_name().to_string_lossy().into_owned();
            match parse_file_name(&prefix, &name) {
                Some((piece_id, version)) => {
                    pieces.push((piece_id, PiecePaths::new(base, &piece_id, version)))
                }
                None if name.ends_with(V0_HEADER_EXTENSION) => {}
                None => debug!("Skipping unrecognised file {}", file.path().display()),
            }
        }
    }

    Ok(pieces)
}

/// Stamp the file's modification time with the current time.
async fn touch(path: &Path) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = fs::File::options().write(true).open(&path)?;
        file.set_modified(SystemTime::now())
    })
    .await
    .map_err(std::io::Error::other)?
}

#[async_trait]
impl Storage for LocalStorage {
    async fn writer(&self, piece_id: PieceId) -> Result<Box<dyn PieceWriter>, StorageError> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let temp_path = self
            .path
            .join(TEMP_DIR)
            .join(format!("{}-{suffix}.partial", piece_id.to_string().to_lowercase()));

        let mut file = File::create(&temp_path).await?;
        file.write_all(&[0u8; V1_HEADER_SIZE]).await?;

        Ok(Box::new(LocalPieceWriter {
            piece_id,
            blobs: self.blobs(),
            temp_path,
            file: Some(file),
            size: 0,
            finished: false,
        }))
    }

    async fn reader(&self, piece_id: &PieceId) -> Result<Box<dyn PieceReader>, StorageError> {
        let paths = locate(&self.blobs(), piece_id)
            .await?
            .ok_or(StorageError::NotFound(*piece_id))?;
        let header = paths.read_header().await?;
        let size = paths.payload_size().await?;
        let file = File::open(&paths.payload).await?;

        Ok(Box::new(LocalPieceReader {
            file,
            header,
            offset: paths.payload_offset(),
            size,
        }))
    }

    async fn stat(&self, piece_id: &PieceId) -> Result<PieceInfo, StorageError> {
        let paths = locate(&self.blobs(), piece_id)
            .await?
            .ok_or(StorageError::NotFound(*piece_id))?;
        Ok(PieceInfo {
            piece_id: *piece_id,
            size: paths.payload_size().await?,
            header: paths.read_header().await?,
        })
    }

    async fn exists(&self, piece_id: &PieceId) -> Result<bool, StorageError> {
        Ok(locate(&self.blobs(), piece_id).await?.is_some())
    }

    async fn delete(&self, piece_id: &PieceId) -> Result<(), StorageError> {
        let paths = locate(&self.blobs(), piece_id)
            .await?
            .ok_or(StorageError::NotFound(*piece_id))?;
        paths.remove().await?;
        debug!("Deleted piece {piece_id}");
        Ok(())
    }

    async fn trash(&self, piece_id: &PieceId) -> Result<(), StorageError> {
        let paths = locate(&self.blobs(), piece_id)
            .await?
            .ok_or(StorageError::NotFound(*piece_id))?;
        let target = PiecePaths::new(&self.trash_dir(), piece_id, paths.version);
        paths.move_to(&target).await?;
        touch(&target.payload).await?;
        debug!("Moved piece {piece_id} to trash");
        Ok(())
    }

    async fn restore_trash(&self) -> Result<Vec<PieceId>, StorageError> {
        let blobs = self.blobs();
        let mut restored = Vec::new();
        for (piece_id, paths) in walk(&self.trash_dir()).await? {
            paths
                .move_to(&PiecePaths::new(&blobs, &piece_id, paths.version))
                .await?;
            restored.push(piece_id);
        }
        Ok(restored)
    }

    async fn empty_trash(
        &self,
        trashed_before: DateTime<Utc>,
    ) -> Result<Vec<PieceId>, StorageError> {
        let mut removed = Vec::new();
        for (piece_id, paths) in walk(&self.trash_dir()).await? {
            let trashed_at: DateTime<Utc> = tokio::fs::metadata(&paths.payload)
                .await?
                .modified()?
                .into();
            if trashed_at < trashed_before {
                paths.remove().await?;
                removed.push(piece_id);
            }
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<PieceInfo>, StorageError> {
        let mut pieces = Vec::new();
        for (piece_id, paths) in walk(&self.blobs()).await? {
            match paths.read_header().await {
                Ok(header) => pieces.push(PieceInfo {
                    piece_id,
                    size: paths.payload_size().await?,
                    header,
                }),
                Err(err) => warn!("Skipping piece {piece_id} with unreadable header: {err}"),
            }
        }
        Ok(pieces)
    }
}

pub struct LocalPieceWriter {
    piece_id: PieceId,
    blobs: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    size: u64,
    finished: bool,
}

impl LocalPieceWriter {
    fn file(&mut self) -> Result<&mut File, StorageError> {
        self.file
            .as_mut()
            .ok_or_else(|| StorageError::WriteError("piece writer is closed".into()))
    }
}

#[async_trait]
impl PieceWriter for LocalPieceWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.file()?.write_all(data).await?;
        self.size += data.len() as u64;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(&mut self, header: PieceHeader) -> Result<(), StorageError> {
        let header = PieceHeader {
            format_version: FormatVersion::V1,
            ..header
        };
        let region = header.encode_framed()?;

        let file = self.file()?;
        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(&region).await?;
        file.flush().await?;
        file.sync_all().await?;
        self.file = None;

        let target = PiecePaths::new(&self.blobs, &self.piece_id, FormatVersion::V1);
        if let Some(parent) = target.payload.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&self.temp_path, &target.payload).await?;
        self.finished = true;

        // A rewritten legacy piece must not shadow the new one.
        let legacy = PiecePaths::new(&self.blobs, &self.piece_id, FormatVersion::V0);
        remove_if_exists(&legacy.payload).await?;
        if let Some(header) = &legacy.header {
            remove_if_exists(header).await?;
        }

        debug!("Committed piece {} ({} bytes)", self.piece_id, self.size);
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), StorageError> {
        self.file = None;
        if !self.finished {
            self.finished = true;
            remove_if_exists(&self.temp_path).await?;
        }
        Ok(())
    }
}

impl Drop for LocalPieceWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.file = None;
        if let Err(err) = fs::remove_file(&self.temp_path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    "Failed to remove uncommitted piece {}: {err}",
                    self.temp_path.display()
                );
            }
        }
    }
}

pub struct LocalPieceReader {
    file: File,
    header: PieceHeader,
    offset: u64,
    size: u64,
}

#[async_trait]
impl PieceReader for LocalPieceReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn header(&self) -> &PieceHeader {
        &self.header
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => {}
            _ => {
                return Err(StorageError::ReadError(format!(
                    "range {offset}+{len} is outside the {}-byte piece",
                    self.size
                )))
            }
        }

        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(self.offset + offset)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}
