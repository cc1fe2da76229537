use seedbridge_transfer::{Transfer, TransferStatus};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::status::{status_code, TorrentStatus};

/// Transmission's "local error" code, used for any remote-reported failure.
const ERROR_LOCAL: i64 = 3;
const ETA_UNKNOWN: i64 = -1;

/// One `torrent-get` object, field names as the front end expects them.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TorrentInfo {
    pub id: i64,
    pub hash_string: String,
    pub name: String,
    pub download_dir: String,
    pub total_size: u64,
    pub left_until_done: u64,
    pub is_finished: bool,
    pub eta: i64,
    pub status: TorrentStatus,
    pub error: i64,
    pub error_string: String,
    pub downloaded_ever: u64,
    pub file_count: usize,
    pub percent_done: f64,
    pub labels: Vec<String>,
    pub files: Vec<TorrentFileInfo>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TorrentFileInfo {
    pub name: String,
    pub length: u64,
    pub bytes_completed: u64,
}

/// 40 hex characters derived from the transfer id, the width front ends
/// expect for an info-hash.
pub fn hash_string(transfer_id: &str) -> String {
    let digest = Sha256::digest(transfer_id.as_bytes());
    hex::encode(&digest[..20])
}

/// Numeric protocol id: the transfer id itself when it is a positive integer,
/// otherwise a stable positive value derived from its hash.
pub fn numeric_id(transfer_id: &str) -> i64 {
    if let Ok(id) = transfer_id.parse::<i64>() {
        if id > 0 {
            return id;
        }
    }
    let digest = Sha256::digest(transfer_id.as_bytes());
    let derived = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff;
    i64::from(derived.max(1))
}

pub fn torrent_info(transfer: &Transfer, download_dir: &str, label: &str) -> TorrentInfo {
    let left_until_done = transfer.bytes_left();
    let status = status_code(&transfer.status);
    let failed = transfer.parsed_status() == Some(TransferStatus::Error)
        || transfer.error_message.is_some();

    let error_string = match (&transfer.error_message, failed) {
        (Some(message), _) => message.clone(),
        (None, true) => "remote transfer failed".to_string(),
        (None, false) => String::new(),
    };

    let eta = match transfer.eta_seconds {
        _ if left_until_done == 0 && transfer.is_available() => 0,
        Some(seconds) => i64::try_from(seconds).unwrap_or(i64::MAX),
        None => ETA_UNKNOWN,
    };

    let available = transfer.is_available();
    let files = transfer
        .files
        .iter()
        .map(|file| TorrentFileInfo {
            name: file.path.clone(),
            length: file.size,
            bytes_completed: if available { file.size } else { 0 },
        })
        .collect();

    TorrentInfo {
        id: numeric_id(&transfer.id),
        hash_string: hash_string(&transfer.id),
        name: transfer.name.clone(),
        download_dir: download_dir.to_string(),
        total_size: transfer.size,
        left_until_done,
        is_finished: available && left_until_done == 0,
        eta,
        status,
        error: if failed { ERROR_LOCAL } else { 0 },
        error_string,
        downloaded_ever: transfer.downloaded,
        file_count: transfer.files.len(),
        percent_done: transfer.completion(),
        labels: vec![label.to_string()],
        files,
    }
}

/// Keeps only the requested fields; an empty request returns everything.
pub fn project(info: &TorrentInfo, fields: &[String]) -> Result<Value, serde_json::Error> {
    let value = serde_json::to_value(info)?;
    if fields.is_empty() {
        return Ok(value);
    }
    Ok(match value {
        Value::Object(all) => {
            let mut selected = Map::new();
            for field in fields {
                if let Some(item) = all.get(field) {
                    selected.insert(field.clone(), item.clone());
                }
            }
            Value::Object(selected)
        }
        other => other,
    })
}
