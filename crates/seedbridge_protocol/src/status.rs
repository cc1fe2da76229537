use seedbridge_transfer::TransferStatus;
use serde::{Serialize, Serializer};
use tracing::warn;

/// The front end's closed status-code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TorrentStatus {
    Stopped = 0,
    CheckWait = 1,
    Check = 2,
    DownloadWait = 3,
    Download = 4,
    SeedWait = 5,
    Seed = 6,
}

/// Code reported for statuses the table does not know. A queued-looking
/// state never triggers an import on the front end.
pub const FALLBACK_STATUS: TorrentStatus = TorrentStatus::DownloadWait;

impl TorrentStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl Serialize for TorrentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl From<TransferStatus> for TorrentStatus {
    fn from(status: TransferStatus) -> Self {
        match status {
            TransferStatus::Queued | TransferStatus::Waiting => Self::DownloadWait,
            TransferStatus::Downloading => Self::Download,
            TransferStatus::Checking | TransferStatus::Verifying => Self::Check,
            TransferStatus::Completed | TransferStatus::Finished => Self::Stopped,
            TransferStatus::Seeding => Self::Seed,
            TransferStatus::SeedingWait => Self::SeedWait,
            TransferStatus::Error => Self::Stopped,
        }
    }
}

/// Maps a raw remote status string onto a status code; unknown strings get
/// [`FALLBACK_STATUS`] and a warning.
pub fn status_code(raw: &str) -> TorrentStatus {
    match TransferStatus::parse(raw) {
        Some(status) => status.into(),
        None => {
            warn!(status = %raw, fallback = FALLBACK_STATUS.code(), "unmapped remote transfer status");
            FALLBACK_STATUS
        }
    }
}
