//! Download-client RPC surface served to the media front end.

mod app;

pub use app::{
    build_router, AppState, Credentials, RpcSettings, RPC_PATH, RPC_VERSION, RPC_VERSION_MINIMUM,
    SESSION_ID_HEADER,
};
