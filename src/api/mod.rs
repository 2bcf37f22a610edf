//! RPC Module
//!
//! Serves the Identity, Controller and Node services as JSON over HTTP POST
//! at `/csi.v1.<Service>/<Method>`.

pub mod rpc;
pub mod server;

pub use rpc::{build_router, RpcError, Services, DEADLINE_HEADER};
pub use server::RpcServer;
