//! 长度前缀流式成帧
//!
//! 每条消息序列化后，前置 4 字节小端无符号整数表示消息体字节长度。
//! 读端把字节累积进缓冲区，凑齐"4 字节前缀 + 声明长度"即提取一条完整
//! 消息并推进缓冲区；不足时挂起等待更多字节。读取由单一持有者串行
//! 驱动，并发读请求天然按 FIFO 得到服务；流结束或出错时未完成的读取
//! 以错误收尾。写端把前缀与消息体合并成一次写入并 flush，对底层
//! sink 整体成功或整体失败。

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MarksyncError, Result};

/// 长度前缀占用的字节数
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// 单帧默认上限（16 MB），防御性约束而非协议要求
const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// 帧读取器
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_len,
        }
    }

    /// 读取下一条完整消息体
    ///
    /// 返回 `Ok(None)` 表示流在帧边界处正常结束；帧中途断流视为错误。
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.try_extract()? {
                return Ok(Some(frame));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(MarksyncError::Transport(
                    "流在帧中途结束，丢弃不完整数据".to_string(),
                ));
            }
        }
    }

    /// 读取并反序列化为指定类型
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.read_frame().await? {
            Some(body) => {
                let message = serde_json::from_slice(&body)?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// 尝试从缓冲区提取一条完整帧
    fn try_extract(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_BYTES]);
        let declared = u32::from_le_bytes(prefix) as usize;

        if declared > self.max_frame_len {
            return Err(MarksyncError::Transport(format!(
                "帧长度 {} 超过上限 {}",
                declared, self.max_frame_len
            )));
        }

        if self.buf.len() < LENGTH_PREFIX_BYTES + declared {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_BYTES);
        let body = self.buf.split_to(declared);
        Ok(Some(body.to_vec()))
    }
}

/// 帧写入器
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// 写出一条消息体（前缀 + 消息体作为一个整体写入并 flush）
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        let len = u32::try_from(body.len()).map_err(|_| {
            MarksyncError::InvalidArgument(format!("消息体过大: {} 字节", body.len()))
        })?;

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + body.len());
        frame.put_u32_le(len);
        frame.put_slice(body);

        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// 序列化并写出一条消息
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        self.write_frame(&body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        seq: u32,
        text: String,
    }

    #[tokio::test]
    async fn test_round_trip_multiple_frames() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        for seq in 0..5u32 {
            writer
                .write_message(&Probe {
                    seq,
                    text: format!("消息 {}", seq),
                })
                .await
                .unwrap();
        }
        drop(writer);

        for seq in 0..5u32 {
            let got: Probe = reader.read_message().await.unwrap().unwrap();
            assert_eq!(got.seq, seq);
        }
        // 帧边界处正常结束
        assert!(reader.read_message::<Probe>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_delivery_blocks_until_complete() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(server);

        let body = serde_json::to_vec(&Probe {
            seq: 7,
            text: "切碎投递".to_string(),
        })
        .unwrap();
        let mut raw = Vec::new();
        raw.extend_from_slice(&(body.len() as u32).to_le_bytes());
        raw.extend_from_slice(&body);

        // 逐字节写入，读端必须等到凑齐整帧才返回
        let feeder = tokio::spawn(async move {
            for byte in raw {
                client.write_all(&[byte]).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let got: Probe = reader.read_message().await.unwrap().unwrap();
        assert_eq!(got.seq, 7);
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(server);

        // 声明 100 字节但只给 3 字节
        client.write_all(&100u32.to_le_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::with_max_frame_len(server, 16);

        client.write_all(&1024u32.to_le_bytes()).await.unwrap();
        assert!(reader.read_frame().await.is_err());
    }
}
