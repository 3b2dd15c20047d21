//! 提供表示数据包的类型，以及数据包头的编码、解码工具。
//!
//! 数据包格式：`长度(u16, 大端) + 保留(4 字节) + 数据体`。
//! 长度字段记录的是包头加数据体的总长度，即`6 + len(body)`。

use bytes::{BufMut, Bytes, BytesMut};

/// 包头长度。
pub const HEADER_SIZE: usize = 6;

/// 长度字段所占的字节数。
pub const LENGTH_FIELD_SIZE: usize = 2;

/// 数据体的最大长度，总长度必须能放进`u16`。
pub const MAX_BODY_SIZE: usize = u16::MAX as usize - HEADER_SIZE;

/// 只有包头、没有数据体的保活包。
pub fn keep_alive() -> [u8; HEADER_SIZE] {
    zip_header(0)
}

/// 解码后交给请求回调的数据包。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// 收到这个包的连接 id。
    pub connection_id: u32,

    /// 已绑定的会话 id。
    pub session_id: i64,

    /// 数据体。
    pub body: Bytes,
}

/// 编码或解码数据包时可能出现的错误。
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    /// 数据体太长，长度字段放不下。
    #[error("数据体过长：{0} 字节，最多 {max} 字节", max = MAX_BODY_SIZE)]
    TooLarge(usize),

    /// 包头不足 6 字节。
    #[error("包头不完整：只有 {0} 字节")]
    ShortHeader(usize),

    /// 长度字段小于包头长度。
    #[error("不合法的包长度：{0}")]
    InvalidLength(u16),
}

/// 返回包头长度。
pub fn header_size() -> usize {
    HEADER_SIZE
}

/// 将数据体编码为完整的数据包。
///
/// 数据体为空时返回空的`Bytes`，调用方不应该发送它。
///
/// # Errors
/// 数据体超过`MAX_BODY_SIZE`时返回`PacketError::TooLarge`。
pub fn encode(body: &[u8]) -> Result<Bytes, PacketError> {
    if body.is_empty() {
        return Ok(Bytes::new());
    }
    if body.len() > MAX_BODY_SIZE {
        return Err(PacketError::TooLarge(body.len()));
    }

    let mut packet = BytesMut::with_capacity(HEADER_SIZE + body.len());
    packet.put_slice(&zip_header(body.len()));
    packet.put_slice(body);
    Ok(packet.freeze())
}

/// 解码包头，返回数据体的长度。
///
/// 包头不完整或长度字段小于`HEADER_SIZE`时返回`0`。
/// 调用方要把`0`当作“什么都没读到”，而不是一个合法的空数据包。
pub fn decode_header(header: &[u8]) -> usize {
    check_header(header).unwrap_or(0)
}

/// 严格版本的`decode_header()`，读取循环使用它。
///
/// # Errors
/// 包头不足 6 字节，或长度字段小于 6 时返回`Err`。
pub fn check_header(header: &[u8]) -> Result<usize, PacketError> {
    if header.len() < HEADER_SIZE {
        return Err(PacketError::ShortHeader(header.len()));
    }
    let total = read_short(&header[..LENGTH_FIELD_SIZE]);
    if (total as usize) < HEADER_SIZE {
        return Err(PacketError::InvalidLength(total));
    }
    Ok(total as usize - HEADER_SIZE)
}

/// 生成包头，保留字段填`0`。
fn zip_header(body_size: usize) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    // 调用前已经检查过长度，这里不会截断。
    let total = (HEADER_SIZE + body_size) as u16;
    header[..LENGTH_FIELD_SIZE].copy_from_slice(&total.to_be_bytes());
    header
}

/// 从两个字节中读取大端的`u16`。
fn read_short(src: &[u8]) -> u16 {
    u16::from_be_bytes([src[0], src[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ping() {
        let packet = encode(b"PING").unwrap();
        assert_eq!(
            &packet[..],
            &[0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, b'P', b'I', b'N', b'G']
        );
        assert_eq!(decode_header(&packet[..HEADER_SIZE]), 4);
    }

    #[test]
    fn encode_empty_body() {
        assert!(encode(b"").unwrap().is_empty());
    }

    #[test]
    fn decode_matches_body_len() {
        for len in [1usize, 2, 255, 256, 1024, 4097, MAX_BODY_SIZE] {
            let body = vec![7u8; len];
            let packet = encode(&body).unwrap();
            assert_eq!(packet.len(), len + HEADER_SIZE);
            assert_eq!(decode_header(&packet[..HEADER_SIZE]), len);
        }
    }

    #[test]
    fn reserved_bytes_are_ignored() {
        let header = [0x00, 0x10, 0xde, 0xad, 0xbe, 0xef];
        assert_eq!(decode_header(&header), 10);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let body = vec![0u8; MAX_BODY_SIZE + 1];
        assert_eq!(
            encode(&body),
            Err(PacketError::TooLarge(MAX_BODY_SIZE + 1))
        );
    }

    #[test]
    fn bad_headers_decode_to_zero() {
        assert_eq!(decode_header(&[]), 0);
        assert_eq!(decode_header(&[0x00]), 0);
        assert_eq!(decode_header(&[0u8; HEADER_SIZE]), 0);
        assert_eq!(decode_header(&[0x00, 0x05, 0, 0, 0, 0]), 0);

        assert_eq!(check_header(&[0x00]), Err(PacketError::ShortHeader(1)));
        assert_eq!(
            check_header(&[0u8; HEADER_SIZE]),
            Err(PacketError::InvalidLength(0))
        );
        assert_eq!(check_header(&[0x00, 0x06, 0, 0, 0, 0]), Ok(0));
        assert_eq!(check_header(&keep_alive()), Ok(0));
    }
}
