//! 控制消息的确定性结构编码。
//!
//! # 模块定位（Why）
//! - 描述符与回执在两个独立进程之间逐位对齐，编码必须跨运行、跨主机稳定：
//!   整数一律 u64 小端，二进制句柄一律 u64 小端长度前缀，字段按声明顺序排列、无填充。
//! - 解码端对每一次读取做显式边界检查，残留字节视为协议错误——宁可失败也不静默截断。
//!
//! # 使用契约（What）
//! - 编码侧用 [`WireWriter`] 按字段顺序写入后 `finish`；
//! - 解码侧用 [`WireReader`] 按同样顺序读出后 `finish` 校验无残留；
//! - 所有错误以 `protocol.decode` 报出，消息中注明缺失的字段语境。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{codes, WeftError};

/// 顺序写出字段的编码器。
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// 写入一个 u64（小端）。
    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    /// 写入一段长度前缀的二进制串。
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.put_u64_le(value.len() as u64);
        self.buf.put_slice(value);
    }

    /// 写入一段长度前缀的 UTF-8 字符串。
    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// 冻结为只读字节串。
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// 顺序读出字段的解码器。
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// 读出一个 u64（小端）。
    pub fn get_u64(&mut self, field: &'static str) -> Result<u64, WeftError> {
        if self.buf.remaining() < 8 {
            return Err(decode_error(field, "truncated u64"));
        }
        Ok(self.buf.get_u64_le())
    }

    /// 读出一段长度前缀的二进制串（零拷贝切分）。
    pub fn get_bytes(&mut self, field: &'static str) -> Result<Bytes, WeftError> {
        let len = self.get_u64(field)?;
        let len = usize::try_from(len).map_err(|_| decode_error(field, "length overflows"))?;
        if self.buf.remaining() < len {
            return Err(decode_error(field, "truncated payload"));
        }
        Ok(self.buf.split_to(len))
    }

    /// 读出一段长度前缀的 UTF-8 字符串。
    pub fn get_str(&mut self, field: &'static str) -> Result<String, WeftError> {
        let raw = self.get_bytes(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| decode_error(field, "invalid utf-8"))
    }

    /// 校验消息无残留字节。
    pub fn finish(self) -> Result<(), WeftError> {
        if self.buf.has_remaining() {
            return Err(WeftError::new(
                codes::PROTOCOL_DECODE,
                format!("{} trailing bytes after message", self.buf.remaining()),
            ));
        }
        Ok(())
    }
}

fn decode_error(field: &'static str, detail: &'static str) -> WeftError {
    WeftError::new(
        codes::PROTOCOL_DECODE,
        format!("failed to decode `{field}`: {detail}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_round_trip_in_declaration_order() {
        let mut writer = WireWriter::new();
        writer.put_str("alloc-7");
        writer.put_bytes(&[0xde, 0xad, 0xbe, 0xef]);
        writer.put_u64(4096);
        let encoded = writer.finish();

        let mut reader = WireReader::new(encoded);
        assert_eq!(reader.get_str("allocation_id").unwrap(), "alloc-7");
        assert_eq!(
            reader.get_bytes("handle").unwrap().as_ref(),
            &[0xde, 0xad, 0xbe, 0xef]
        );
        assert_eq!(reader.get_u64("offset").unwrap(), 4096);
        reader.finish().unwrap();
    }

    #[test]
    fn empty_message_encodes_to_zero_bytes() {
        let encoded = WireWriter::new().finish();
        assert!(encoded.is_empty());
        WireReader::new(encoded).finish().unwrap();
    }

    #[test]
    fn truncated_input_is_a_decode_error() {
        let mut writer = WireWriter::new();
        writer.put_bytes(&[1, 2, 3]);
        let mut encoded = writer.finish();
        let truncated = encoded.split_to(encoded.len() - 1);

        let mut reader = WireReader::new(truncated);
        let err = reader.get_bytes("handle").unwrap_err();
        assert_eq!(err.code(), codes::PROTOCOL_DECODE);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut writer = WireWriter::new();
        writer.put_u64(1);
        writer.put_u64(2);
        let encoded = writer.finish();

        let mut reader = WireReader::new(encoded);
        reader.get_u64("first").unwrap();
        let err = reader.finish().unwrap_err();
        assert_eq!(err.code(), codes::PROTOCOL_DECODE);
    }
}
