use std::path::Path;

use async_trait::async_trait;
use seedbridge_transfer::{Transfer, TransferFile};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote service error (status {status:?}): {message}")]
    Network { status: Option<u16>, message: String },
    #[error("remote entry not found: {0}")]
    NotFound(String),
    #[error("directory resolution failed: {0}")]
    DirectoryResolution(String),
    #[error("remote authentication failed: {0}")]
    Authentication(String),
    #[error("remote client does not support {0}")]
    Unsupported(&'static str),
    #[error("local i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn network(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Network {
            status,
            message: message.into(),
        }
    }
}

/// A node of the remote file tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEntry {
    File { id: String, name: String, size: u64 },
    Folder { id: String, name: String },
}

impl RemoteEntry {
    pub fn id(&self) -> &str {
        match self {
            Self::File { id, .. } | Self::Folder { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } | Self::Folder { name, .. } => name,
        }
    }
}

/// The remote seedbox service.
#[async_trait]
pub trait SeedboxClient: Send + Sync {
    /// Transfers carrying `tag`. File manifests are left empty; see
    /// [`crate::fetch_tagged_transfers`].
    async fn list_tagged_transfers(&self, tag: &str) -> Result<Vec<Transfer>, RemoteError>;

    /// `Ok(None)` once the transfer no longer exists remotely.
    async fn get_transfer(&self, transfer_id: &str) -> Result<Option<Transfer>, RemoteError>;

    async fn create_transfer_from_link(&self, link: &str, tag: &str) -> Result<Transfer, RemoteError>;

    /// Removes the transfer and its remote files. `Ok(false)` when it was
    /// already gone.
    async fn remove_transfer(&self, transfer_id: &str) -> Result<bool, RemoteError>;

    async fn get_entry(&self, entry_id: &str) -> Result<RemoteEntry, RemoteError>;

    async fn list_folder(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Streams one remote file to `destination`, returning the bytes written.
    async fn download_file(&self, file: &TransferFile, destination: &Path) -> Result<u64, RemoteError>;

    /// The optional torrent-file upload capability, if the remote has it.
    fn payload_uploader(&self) -> Option<&dyn PayloadUploader> {
        None
    }
}

/// Secondary capability: creating a transfer from raw torrent-file bytes.
#[async_trait]
pub trait PayloadUploader: Send + Sync {
    async fn create_transfer_from_payload(
        &self,
        filename: &str,
        payload: Vec<u8>,
        tag: &str,
    ) -> Result<Transfer, RemoteError>;
}
