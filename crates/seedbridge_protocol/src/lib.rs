pub mod codec;
pub mod envelope;
pub mod status;
pub mod torrent;

pub use codec::{decode_metainfo, validate_structure, Metainfo, MetainfoError, DEFAULT_MAX_METAINFO_BYTES};
pub use envelope::{
    RpcRequest, RpcResponse, SessionInfo, TorrentAddArguments, TorrentAdded, TorrentGetArguments,
    TorrentIds, TorrentRef, TorrentRemoveArguments, METHOD_SESSION_GET, METHOD_TORRENT_ADD,
    METHOD_TORRENT_GET, METHOD_TORRENT_REMOVE, RESULT_SUCCESS,
};
pub use status::{status_code, TorrentStatus, FALLBACK_STATUS};
pub use torrent::{hash_string, numeric_id, project, torrent_info, TorrentFileInfo, TorrentInfo};
