//! CUDA IPC 通道的三种控制消息。
//!
//! 描述符经带外途径转交；回执（Reply）走 reply 控制流、确认（Ack）走 ack 控制流。
//! 编码基于 `weft-core` 的确定性结构编码：字段按声明顺序、u64 小端、
//! 二进制句柄带长度前缀，两侧逐位一致。

use bytes::Bytes;

use weft_core::{WeftError, WireReader, WireWriter};

/// 描述符：接收方消费它来定位并等待发送方的显存。
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Descriptor {
    /// 发送进程标识 + 缓冲标识，接收方以它为键缓存已打开的分配。
    pub allocation_id: String,
    /// 基址分配的显存 IPC 句柄。
    pub handle: Bytes,
    /// 源指针相对基址的字节偏移。
    pub offset: u64,
    /// 发送方起始事件的 IPC 句柄。
    pub start_ev_handle: Bytes,
}

impl Descriptor {
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        writer.put_str(&self.allocation_id);
        writer.put_bytes(&self.handle);
        writer.put_u64(self.offset);
        writer.put_bytes(&self.start_ev_handle);
        writer.finish()
    }

    pub fn decode(raw: Bytes) -> Result<Self, WeftError> {
        let mut reader = WireReader::new(raw);
        let allocation_id = reader.get_str("allocation_id")?;
        let handle = reader.get_bytes("handle")?;
        let offset = reader.get_u64("offset")?;
        let start_ev_handle = reader.get_bytes("start_ev_handle")?;
        reader.finish()?;
        Ok(Self {
            allocation_id,
            handle,
            offset,
            start_ev_handle,
        })
    }
}

/// 回执：接收方向发送方转交停止事件的 IPC 句柄。
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Reply {
    pub stop_ev_handle: Bytes,
}

impl Reply {
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        writer.put_bytes(&self.stop_ev_handle);
        writer.finish()
    }

    pub fn decode(raw: Bytes) -> Result<Self, WeftError> {
        let mut reader = WireReader::new(raw);
        let stop_ev_handle = reader.get_bytes("stop_ev_handle")?;
        reader.finish()?;
        Ok(Self { stop_ev_handle })
    }
}

/// 确认：零字段消息，仅存在本身携带语义。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Ack;

impl Ack {
    pub fn encode(&self) -> Bytes {
        WireWriter::new().finish()
    }

    pub fn decode(raw: Bytes) -> Result<Self, WeftError> {
        WireReader::new(raw).finish()?;
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ack_is_zero_bytes() {
        assert!(Ack.encode().is_empty());
        Ack::decode(Bytes::new()).unwrap();
        assert!(Ack::decode(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn descriptor_rejects_trailing_bytes() {
        let descriptor = Descriptor {
            allocation_id: "1234:0_42".to_owned(),
            handle: Bytes::from(vec![7u8; 64]),
            offset: 128,
            start_ev_handle: Bytes::from(vec![9u8; 64]),
        };
        let mut raw = descriptor.encode().to_vec();
        raw.push(0);
        assert!(Descriptor::decode(Bytes::from(raw)).is_err());
    }

    proptest! {
        /// 描述符编解码是双射：decode(encode(d)) == d。
        #[test]
        fn descriptor_round_trips(
            allocation_id in "[a-z0-9:_]{0,32}",
            handle in proptest::collection::vec(any::<u8>(), 0..128),
            offset in any::<u64>(),
            start_ev_handle in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let descriptor = Descriptor {
                allocation_id,
                handle: Bytes::from(handle),
                offset,
                start_ev_handle: Bytes::from(start_ev_handle),
            };
            let decoded = Descriptor::decode(descriptor.encode()).unwrap();
            prop_assert_eq!(decoded, descriptor);
        }

        #[test]
        fn reply_round_trips(stop in proptest::collection::vec(any::<u8>(), 0..128)) {
            let reply = Reply { stop_ev_handle: Bytes::from(stop) };
            let decoded = Reply::decode(reply.encode()).unwrap();
            prop_assert_eq!(decoded, reply);
        }
    }
}
