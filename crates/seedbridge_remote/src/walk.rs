//! Builds transfer file manifests from the remote file tree.

use std::collections::HashSet;

use seedbridge_transfer::{Transfer, TransferFile};
use tracing::{debug, warn};

use crate::client::{RemoteEntry, RemoteError, SeedboxClient};

/// Lists tagged transfers and fills in the file manifest of every transfer
/// whose content has materialized. A transfer whose tree cannot be resolved
/// keeps an empty manifest so it is never considered downloadable.
pub async fn fetch_tagged_transfers(
    client: &dyn SeedboxClient,
    tag: &str,
) -> Result<Vec<Transfer>, RemoteError> {
    let mut transfers = client.list_tagged_transfers(tag).await?;
    for transfer in &mut transfers {
        if !transfer.files.is_empty() {
            continue;
        }
        let Some(handle) = transfer.file_handle.clone() else {
            continue;
        };
        match resolve_files(client, &handle).await {
            Ok(files) => transfer.files = files,
            Err(err) => {
                warn!(transfer_id = %transfer.id, error = %err, "could not resolve transfer files");
            }
        }
    }
    Ok(transfers)
}

/// Walks the tree under `handle` and returns every file with its path
/// relative to the transfer root. A file handle yields a single entry.
pub async fn resolve_files(
    client: &dyn SeedboxClient,
    handle: &str,
) -> Result<Vec<TransferFile>, RemoteError> {
    let root = client.get_entry(handle).await?;
    let (root_id, root_name) = match root {
        RemoteEntry::File { id, name, size } => {
            return Ok(vec![TransferFile {
                file_id: id,
                path: checked_component(&name)?.to_string(),
                size,
            }]);
        }
        RemoteEntry::Folder { id, name } => (id, checked_component(&name)?.to_string()),
    };

    let mut files = Vec::new();
    let mut visited = HashSet::new();
    let mut pending = vec![(root_id, root_name)];

    while let Some((folder_id, prefix)) = pending.pop() {
        if !visited.insert(folder_id.clone()) {
            return Err(RemoteError::DirectoryResolution(format!(
                "folder {folder_id} appears twice in the tree"
            )));
        }
        for entry in client.list_folder(&folder_id).await? {
            let path = format!("{prefix}/{}", checked_component(entry.name())?);
            match entry {
                RemoteEntry::File { id, size, .. } => files.push(TransferFile {
                    file_id: id,
                    path,
                    size,
                }),
                RemoteEntry::Folder { id, .. } => pending.push((id, path)),
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(handle = %handle, files = files.len(), "resolved remote file tree");
    Ok(files)
}

/// Rejects names that would escape the transfer root once joined locally.
fn checked_component(name: &str) -> Result<&str, RemoteError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains('\0')
    {
        return Err(RemoteError::DirectoryResolution(format!(
            "unsafe remote name {name:?}"
        )));
    }
    Ok(trimmed)
}
