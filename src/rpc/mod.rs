mod framing;
mod server;
mod tools;
mod types;

pub use framing::{FrameError, Framing, MAX_FRAME_LEN, read_frame, write_frame};
pub use server::RpcServer;
pub use tools::{ToolOutput, descriptors};
pub use types::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, RpcRequest,
};
