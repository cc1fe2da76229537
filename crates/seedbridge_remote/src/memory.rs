use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use seedbridge_transfer::{Transfer, TransferFile};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::client::{PayloadUploader, RemoteEntry, RemoteError, SeedboxClient};

#[derive(Debug, Clone)]
struct StoredTransfer {
    tag: String,
    transfer: Transfer,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: RemoteEntry,
    children: Vec<String>,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    transfers: BTreeMap<String, StoredTransfer>,
    entries: HashMap<String, StoredEntry>,
    failing_files: HashSet<String>,
    stalled_files: HashSet<String>,
    uploads: Vec<(String, Vec<u8>)>,
    links: Vec<String>,
}

/// Seedbox held entirely in memory. Used by the daemon when no remote service
/// is wired in, and by tests to script remote behavior.
#[derive(Debug)]
pub struct InMemorySeedboxClient {
    state: RwLock<MemoryState>,
    accept_payloads: bool,
    fail_listing: AtomicBool,
    list_calls: AtomicUsize,
    remove_calls: AtomicUsize,
}

impl Default for InMemorySeedboxClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySeedboxClient {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            accept_payloads: true,
            fail_listing: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
        }
    }

    /// A client lacking the torrent-file upload capability.
    pub fn without_payload_uploads() -> Self {
        Self {
            accept_payloads: false,
            ..Self::new()
        }
    }

    pub async fn insert_transfer(&self, tag: &str, transfer: Transfer) {
        let mut state = self.state.write().await;
        state.transfers.insert(
            transfer.id.clone(),
            StoredTransfer {
                tag: tag.to_string(),
                transfer,
            },
        );
    }

    /// Applies `update` to a stored transfer; returns `false` if it is gone.
    pub async fn update_transfer(&self, transfer_id: &str, update: impl FnOnce(&mut Transfer)) -> bool {
        let mut state = self.state.write().await;
        match state.transfers.get_mut(transfer_id) {
            Some(stored) => {
                update(&mut stored.transfer);
                true
            }
            None => false,
        }
    }

    pub async fn set_status(&self, transfer_id: &str, status: &str) -> bool {
        self.update_transfer(transfer_id, |t| t.status = status.to_string())
            .await
    }

    pub async fn add_folder(&self, parent: Option<&str>, name: &str) -> String {
        let id = Uuid::now_v7().to_string();
        let entry = RemoteEntry::Folder {
            id: id.clone(),
            name: name.to_string(),
        };
        self.add_entry(parent, entry, Vec::new()).await;
        id
    }

    pub async fn add_file(&self, parent: Option<&str>, name: &str, content: Vec<u8>) -> String {
        let id = Uuid::now_v7().to_string();
        let entry = RemoteEntry::File {
            id: id.clone(),
            name: name.to_string(),
            size: content.len() as u64,
        };
        self.add_entry(parent, entry, content).await;
        id
    }

    async fn add_entry(&self, parent: Option<&str>, entry: RemoteEntry, content: Vec<u8>) {
        let mut state = self.state.write().await;
        let id = entry.id().to_string();
        if let Some(parent) = parent.and_then(|p| state.entries.get_mut(p)) {
            parent.children.push(id.clone());
        }
        state.entries.insert(
            id,
            StoredEntry {
                entry,
                children: Vec::new(),
                content,
            },
        );
    }

    /// Makes downloads of `file_id` fail with a network error.
    pub async fn fail_file(&self, file_id: &str) {
        self.state
            .write()
            .await
            .failing_files
            .insert(file_id.to_string());
    }

    /// Makes downloads of `file_id` write half the content and then hang.
    pub async fn stall_file(&self, file_id: &str) {
        self.state
            .write()
            .await
            .stalled_files
            .insert(file_id.to_string());
    }

    pub fn set_listing_failure(&self, failing: bool) {
        self.fail_listing.store(failing, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub async fn uploaded_payloads(&self) -> Vec<(String, Vec<u8>)> {
        self.state.read().await.uploads.clone()
    }

    pub async fn created_links(&self) -> Vec<String> {
        self.state.read().await.links.clone()
    }

    pub async fn contains_transfer(&self, transfer_id: &str) -> bool {
        self.state.read().await.transfers.contains_key(transfer_id)
    }

    fn new_transfer(name: &str) -> Transfer {
        Transfer::new(Uuid::now_v7().to_string(), name, "queued")
    }
}

fn collect_subtree(entries: &HashMap<String, StoredEntry>, root: &str, into: &mut Vec<String>) {
    let mut pending = vec![root.to_string()];
    while let Some(id) = pending.pop() {
        if let Some(entry) = entries.get(&id) {
            pending.extend(entry.children.iter().cloned());
            into.push(id);
        }
    }
}

/// Display name carried in a magnet link's `dn` parameter.
fn magnet_display_name(link: &str) -> Option<String> {
    let query = link.strip_prefix("magnet:?")?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("dn="))
        .map(|name| name.replace('+', " "))
        .filter(|name| !name.is_empty())
}

#[async_trait]
impl SeedboxClient for InMemorySeedboxClient {
    async fn list_tagged_transfers(&self, tag: &str) -> Result<Vec<Transfer>, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(RemoteError::network(Some(503), "listing unavailable"));
        }
        let state = self.state.read().await;
        Ok(state
            .transfers
            .values()
            .filter(|stored| stored.tag == tag)
            .map(|stored| stored.transfer.clone())
            .collect())
    }

    async fn get_transfer(&self, transfer_id: &str) -> Result<Option<Transfer>, RemoteError> {
        let state = self.state.read().await;
        Ok(state
            .transfers
            .get(transfer_id)
            .map(|stored| stored.transfer.clone()))
    }

    async fn create_transfer_from_link(&self, link: &str, tag: &str) -> Result<Transfer, RemoteError> {
        let name = magnet_display_name(link).unwrap_or_else(|| link.to_string());
        let transfer = Self::new_transfer(&name);
        let mut state = self.state.write().await;
        state.links.push(link.to_string());
        state.transfers.insert(
            transfer.id.clone(),
            StoredTransfer {
                tag: tag.to_string(),
                transfer: transfer.clone(),
            },
        );
        info!(transfer_id = %transfer.id, tag = %tag, "transfer created from link");
        Ok(transfer)
    }

    async fn remove_transfer(&self, transfer_id: &str) -> Result<bool, RemoteError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        let Some(stored) = state.transfers.remove(transfer_id) else {
            return Ok(false);
        };
        if let Some(handle) = stored.transfer.file_handle {
            let mut doomed = Vec::new();
            collect_subtree(&state.entries, &handle, &mut doomed);
            for id in doomed {
                state.entries.remove(&id);
            }
        }
        Ok(true)
    }

    async fn get_entry(&self, entry_id: &str) -> Result<RemoteEntry, RemoteError> {
        let state = self.state.read().await;
        state
            .entries
            .get(entry_id)
            .map(|stored| stored.entry.clone())
            .ok_or_else(|| RemoteError::NotFound(entry_id.to_string()))
    }

    async fn list_folder(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let state = self.state.read().await;
        let folder = state
            .entries
            .get(folder_id)
            .ok_or_else(|| RemoteError::NotFound(folder_id.to_string()))?;
        if !matches!(folder.entry, RemoteEntry::Folder { .. }) {
            return Err(RemoteError::DirectoryResolution(format!(
                "{folder_id} is not a folder"
            )));
        }
        Ok(folder
            .children
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|child| child.entry.clone())
            .collect())
    }

    async fn download_file(&self, file: &TransferFile, destination: &Path) -> Result<u64, RemoteError> {
        let (content, stalled) = {
            let state = self.state.read().await;
            if state.failing_files.contains(&file.file_id) {
                return Err(RemoteError::network(
                    Some(500),
                    format!("download of {} failed", file.file_id),
                ));
            }
            let content = state
                .entries
                .get(&file.file_id)
                .map(|stored| stored.content.clone())
                .ok_or_else(|| RemoteError::NotFound(file.file_id.clone()))?;
            (content, state.stalled_files.contains(&file.file_id))
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if stalled {
            tokio::fs::write(destination, &content[..content.len() / 2]).await?;
            return std::future::pending().await;
        }
        tokio::fs::write(destination, &content).await?;
        Ok(content.len() as u64)
    }

    fn payload_uploader(&self) -> Option<&dyn PayloadUploader> {
        if self.accept_payloads {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl PayloadUploader for InMemorySeedboxClient {
    async fn create_transfer_from_payload(
        &self,
        filename: &str,
        payload: Vec<u8>,
        tag: &str,
    ) -> Result<Transfer, RemoteError> {
        let transfer = Self::new_transfer(filename);
        let mut state = self.state.write().await;
        state.uploads.push((filename.to_string(), payload));
        state.transfers.insert(
            transfer.id.clone(),
            StoredTransfer {
                tag: tag.to_string(),
                transfer: transfer.clone(),
            },
        );
        info!(transfer_id = %transfer.id, tag = %tag, "transfer created from payload");
        Ok(transfer)
    }
}
