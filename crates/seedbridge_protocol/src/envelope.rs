use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const RESULT_SUCCESS: &str = "success";

pub const METHOD_TORRENT_ADD: &str = "torrent-add";
pub const METHOD_TORRENT_GET: &str = "torrent-get";
pub const METHOD_TORRENT_REMOVE: &str = "torrent-remove";
pub const METHOD_SESSION_GET: &str = "session-get";

/// `{method, arguments}` request envelope posted to the RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Value>,
}

/// `{result, arguments}` response envelope. `result` is `"success"` or a
/// human-readable failure reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub result: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Value>,
}

impl RpcResponse {
    pub fn success(arguments: Value) -> Self {
        Self {
            result: RESULT_SUCCESS.to_string(),
            arguments,
            tag: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            result: reason.into(),
            arguments: json!({}),
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: Option<Value>) -> Self {
        self.tag = tag;
        self
    }

    pub fn is_success(&self) -> bool {
        self.result == RESULT_SUCCESS
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TorrentAddArguments {
    /// Magnet link or URL of a torrent file.
    pub filename: Option<String>,
    /// Base64-encoded torrent file. Takes precedence over `filename`.
    pub metainfo: Option<String>,
    pub download_dir: Option<String>,
    pub paused: Option<bool>,
    pub labels: Option<Vec<String>>,
}

impl TorrentAddArguments {
    pub fn link(&self) -> Option<&str> {
        non_empty(self.filename.as_deref())
    }

    pub fn payload(&self) -> Option<&str> {
        non_empty(self.metainfo.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TorrentRef {
    Id(i64),
    Hash(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TorrentIds {
    One(TorrentRef),
    Many(Vec<TorrentRef>),
}

pub const RECENTLY_ACTIVE: &str = "recently-active";

impl TorrentIds {
    /// Whether a torrent with the given numeric id and hash string is selected.
    pub fn selects(&self, id: i64, hash_string: &str) -> bool {
        let matches = |reference: &TorrentRef| match reference {
            TorrentRef::Id(wanted) => *wanted == id,
            TorrentRef::Hash(wanted) => {
                wanted == RECENTLY_ACTIVE || wanted.eq_ignore_ascii_case(hash_string)
            }
        };
        match self {
            Self::One(reference) => matches(reference),
            Self::Many(references) => references.iter().any(matches),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TorrentGetArguments {
    #[serde(default)]
    pub fields: Vec<String>,
    pub ids: Option<TorrentIds>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TorrentRemoveArguments {
    pub ids: Option<TorrentIds>,
    #[serde(default)]
    pub delete_local_data: bool,
}

/// Identity of a freshly created torrent, returned under `torrent-added`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TorrentAdded {
    pub id: i64,
    pub name: String,
    pub hash_string: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionInfo {
    pub version: String,
    pub rpc_version: u32,
    pub rpc_version_minimum: u32,
    pub download_dir: String,
}
