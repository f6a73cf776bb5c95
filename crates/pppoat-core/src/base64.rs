//! RFC 4648 标准字母表的 Base64 编解码，供只能承载可打印负载的传输模块使用。
//!
//! # 契约（What）
//! - 字母表依次为大写字母、小写字母、数字、`+`、`/`，填充字符为 `=`；
//! - [`encode`] 与 [`decode`] 对任意长度（含 0）的字节序列互为逆运算；
//! - [`decode`] 只接受 [`is_valid`] 判定合法的文本，失败时不返回任何部分结果。
//!
//! # 使用方式（How）
//! - 来自网络对端的文本必须先经 [`is_valid`] 校验，再调用 [`decode`]；
//! - 需要复用缓冲时使用 [`encode_into`]，避免每帧分配新的 `String`。

use crate::error::{Error, Result};

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
const PAD: u8 = b'=';
const INVALID: u8 = 0xff;

/// 字符到 6 位取值的反查表，非字母表字符映射为 [`INVALID`]。
const DECODE_TABLE: [u8; 256] = {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < ALPHABET.len() {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
};

/// 编码 `n` 字节所需的字符数：`ceil(n / 3) * 4`。
pub const fn encoded_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

/// 计算编码文本解码后的字节数。
///
/// - **前置条件**：`text.len()` 为 4 的倍数，否则返回 [`Error::InvalidLength`]；
/// - 末两位中每出现一个 `=`，结果减一。
pub fn decoded_len(text: &str) -> Result<usize> {
    let bytes = text.as_bytes();
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidLength(bytes.len()));
    }
    Ok(bytes.len() / 4 * 3 - padding_of(bytes))
}

/// 将 `input` 编码为新的 Base64 字符串。
pub fn encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(encoded_len(input.len()));
    encode_into(input, &mut out);
    out
}

/// 将 `input` 的编码结果追加到 `out` 末尾。
///
/// 每 3 字节产出 4 个字符；末尾 1 或 2 个剩余字节的未用低位补零，并以 `=` 填满 4 字符组。
pub fn encode_into(input: &[u8], out: &mut String) {
    out.reserve(encoded_len(input.len()));
    let mut chunks = input.chunks_exact(3);
    for group in &mut chunks {
        let (b0, b1, b2) = (group[0], group[1], group[2]);
        push_sextet(out, b0 >> 2);
        push_sextet(out, (b0 << 4 & 0x3f) | b1 >> 4);
        push_sextet(out, (b1 << 2 & 0x3f) | b2 >> 6);
        push_sextet(out, b2 & 0x3f);
    }
    match *chunks.remainder() {
        [b0] => {
            push_sextet(out, b0 >> 2);
            push_sextet(out, b0 << 4 & 0x3f);
            out.push('=');
            out.push('=');
        }
        [b0, b1] => {
            push_sextet(out, b0 >> 2);
            push_sextet(out, (b0 << 4 & 0x3f) | b1 >> 4);
            push_sextet(out, b1 << 2 & 0x3f);
            out.push('=');
        }
        _ => {}
    }
}

/// 解码 Base64 文本。
///
/// # 错误
/// - 长度不是 4 的倍数：[`Error::InvalidLength`]；
/// - 出现字母表外字符，或 `=` 出现在末两位以外：[`Error::InvalidChar`]，附带首个非法位置。
pub fn decode(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidLength(bytes.len()));
    }
    let body_len = bytes.len() - padding_of(bytes);
    if let Some(position) = first_invalid(&bytes[..body_len]) {
        return Err(Error::InvalidChar {
            position,
            byte: bytes[position],
        });
    }

    let mut out = Vec::with_capacity(bytes.len() / 4 * 3);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &c in &bytes[..body_len] {
        acc = acc << 6 | u32::from(DECODE_TABLE[c as usize]);
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    // 丢弃的余位只剩编码端补的零位。
    Ok(out)
}

/// 判断文本是否为合法的 Base64：长度为 4 的倍数，剥离至多两个末尾 `=` 后其余字符均在字母表中。
pub fn is_valid(text: &str) -> bool {
    let bytes = text.as_bytes();
    if bytes.len() % 4 != 0 {
        return false;
    }
    let body_len = bytes.len() - padding_of(bytes);
    first_invalid(&bytes[..body_len]).is_none()
}

fn push_sextet(out: &mut String, sextet: u8) {
    out.push(ALPHABET[sextet as usize] as char);
}

/// 末两位中的填充个数；仅当倒数第一位是 `=` 时才检查倒数第二位。
fn padding_of(bytes: &[u8]) -> usize {
    match bytes {
        [.., PAD, PAD] => 2,
        [.., PAD] => 1,
        _ => 0,
    }
}

fn first_invalid(body: &[u8]) -> Option<usize> {
    body.iter().position(|&c| DECODE_TABLE[c as usize] == INVALID)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc4648_vectors() {
        let vectors: [(&[u8], &str); 7] = [
            (b"", ""),
            (b"f", "Zg=="),
            (b"fo", "Zm8="),
            (b"foo", "Zm9v"),
            (b"foob", "Zm9vYg=="),
            (b"fooba", "Zm9vYmE="),
            (b"foobar", "Zm9vYmFy"),
        ];
        for (raw, text) in vectors {
            assert_eq!(encode(raw), text);
            assert_eq!(decode(text).expect("合法向量应可解码"), raw);
        }
    }

    #[test]
    fn man_vectors_and_lengths() {
        assert_eq!(encode(&[0x4d, 0x61, 0x6e]), "TWFu");
        assert_eq!(encode(&[0x4d, 0x61]), "TWE=");
        assert_eq!(encode(&[0x4d]), "TQ==");
        assert_eq!(decode("TWFu").expect("解码 TWFu"), [0x4d, 0x61, 0x6e]);
        assert_eq!(decode("TWE=").expect("解码 TWE="), [0x4d, 0x61]);
        assert_eq!(decode("TQ==").expect("解码 TQ=="), [0x4d]);
        assert_eq!(decoded_len("TWFu").ok(), Some(3));
        assert_eq!(decoded_len("TWE=").ok(), Some(2));
        assert_eq!(decoded_len("TQ==").ok(), Some(1));
    }

    #[test]
    fn rejects_foreign_characters() {
        match decode("TW-u") {
            Err(Error::InvalidChar { position, byte }) => {
                assert_eq!(position, 2);
                assert_eq!(byte, b'-');
            }
            other => panic!("应报告非法字符，实际为 {other:?}"),
        }
        assert!(!is_valid("TW-u"));
    }

    #[test]
    fn padding_is_only_accepted_at_the_tail() {
        assert!(!is_valid("T=Fu"));
        assert!(decode("T=Fu").is_err());
        assert!(!is_valid("T==="));
        assert!(decode("T===").is_err());
        assert!(is_valid("TQ=="));
    }

    #[test]
    fn rejects_length_not_multiple_of_four() {
        assert!(matches!(decode("TWF"), Err(Error::InvalidLength(3))));
        assert!(matches!(decoded_len("TWF"), Err(Error::InvalidLength(3))));
        assert!(!is_valid("TWF"));
    }

    #[test]
    fn encode_into_appends() {
        let mut out = String::from("frame:");
        encode_into(b"Ma", &mut out);
        assert_eq!(out, "frame:TWE=");
    }
}
