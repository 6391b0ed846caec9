//! Wire protocol: framing codec and incremental response assembly.

mod response_buffer;
mod wire_format;

pub use response_buffer::{ResponseBuffer, DEFAULT_MAX_PAYLOAD_SIZE};
pub use wire_format::{
    decode_request, decode_response, encode_request, encode_response, Request, Response,
    ERR_WORKER_CRASH, LENGTH_SIZE,
};
