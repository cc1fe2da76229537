//! Shared vocabulary for remote seedbox transfers.
//!
//! Every poll of the remote service yields fresh [`Transfer`] snapshots; nothing
//! here is mutated locally after it has been fetched.

use serde::{Deserialize, Serialize};

pub type TransferId = String;

/// Remote status vocabulary, normalized from the service's free-form strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Queued,
    Waiting,
    Downloading,
    Checking,
    Verifying,
    Completed,
    Finished,
    Seeding,
    SeedingWait,
    Error,
}

impl TransferStatus {
    /// Parses a remote status string. Matching ignores case and treats `_`,
    /// `-` and spaces as the same separator.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                '_' | ' ' => '-',
                other => other.to_ascii_lowercase(),
            })
            .collect();

        let status = match normalized.as_str() {
            "queued" | "in-queue" => Self::Queued,
            "waiting" | "preparing-download" => Self::Waiting,
            "downloading" => Self::Downloading,
            "checking" => Self::Checking,
            "verifying" | "completing" => Self::Verifying,
            "completed" => Self::Completed,
            "finished" => Self::Finished,
            "seeding" => Self::Seeding,
            "seeding-wait" => Self::SeedingWait,
            "error" => Self::Error,
            _ => return None,
        };
        Some(status)
    }

    /// Content is complete on the remote side and may be retrieved.
    pub fn is_available(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Finished | Self::Seeding | Self::SeedingWait
        )
    }

    pub fn is_seeding(self) -> bool {
        matches!(self, Self::Seeding | Self::SeedingWait)
    }
}

/// One file of a transfer's manifest, relative to the transfer's root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferFile {
    pub file_id: String,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transfer {
    pub id: TransferId,
    pub name: String,
    pub size: u64,
    pub downloaded: u64,
    /// Raw remote status string, kept verbatim for display and logging.
    pub status: String,
    /// Empty until content has materialized remotely and been walked.
    #[serde(default)]
    pub files: Vec<TransferFile>,
    pub folder_id: Option<String>,
    /// Handle of the materialized content (a file or a folder) on the remote side.
    pub file_handle: Option<String>,
    pub error_message: Option<String>,
    pub eta_seconds: Option<u64>,
    /// Remote-reported completion in whole percent, when the service provides one.
    pub percent_done: Option<u8>,
}

impl Transfer {
    pub fn new(id: impl Into<TransferId>, name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            size: 0,
            downloaded: 0,
            status: status.into(),
            files: Vec::new(),
            folder_id: None,
            file_handle: None,
            error_message: None,
            eta_seconds: None,
            percent_done: None,
        }
    }

    pub fn parsed_status(&self) -> Option<TransferStatus> {
        TransferStatus::parse(&self.status)
    }

    pub fn is_available(&self) -> bool {
        self.parsed_status().is_some_and(TransferStatus::is_available)
    }

    pub fn is_downloadable(&self) -> bool {
        !self.files.is_empty()
    }

    /// Both gates the orchestrator checks before it attempts a claim.
    pub fn is_ready(&self) -> bool {
        self.is_available() && self.is_downloadable()
    }

    pub fn is_seeding(&self) -> bool {
        self.parsed_status().is_some_and(TransferStatus::is_seeding)
    }

    /// Bytes still to retrieve, never more than `size`.
    ///
    /// The remote's own percentage wins over `size - downloaded`, since the
    /// downloaded counter can overshoot the size when content is compressed
    /// in transit.
    pub fn bytes_left(&self) -> u64 {
        match self.percent_done {
            Some(percent) => {
                let remaining = 100 - u128::from(percent.min(100));
                (u128::from(self.size) * remaining / 100) as u64
            }
            None => self.size.saturating_sub(self.downloaded),
        }
    }

    /// Completion ratio in `0.0..=1.0`.
    pub fn completion(&self) -> f64 {
        if self.size == 0 {
            return if self.is_available() { 1.0 } else { 0.0 };
        }
        let done = self.size - self.bytes_left();
        done as f64 / self.size as f64
    }

    pub fn total_file_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }
}
