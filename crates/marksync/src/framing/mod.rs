//! 消息成帧模块
//!
//! 两套独立编解码器，对应两类传输约束：
//! - `stream`：持久字节流无消息边界，用 4 字节小端长度前缀切帧；
//! - `chunk`：传输层有硬性单包上限（约 1 MB），超限消息先 base64
//!   再切片传输，接收端按 index 重组。

pub mod chunk;
pub mod stream;

pub use chunk::{ChunkAssembler, ChunkCodec, WireEnvelope, DEFAULT_CHUNK_SIZE, DEFAULT_SINGLE_THRESHOLD};
pub use stream::{FrameReader, FrameWriter, LENGTH_PREFIX_BYTES};
