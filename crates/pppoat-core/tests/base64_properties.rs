//! Base64 编解码的性质测试。

use pppoat_core::{Error, base64};
use proptest::prelude::*;

const ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// 任意字节序列编码后再解码得到原文，编码长度满足 `ceil(n/3)*4`。
    #[test]
    fn round_trip_and_length_law(input in prop::collection::vec(any::<u8>(), 0..10_000)) {
        let text = base64::encode(&input);
        prop_assert_eq!(text.len(), base64::encoded_len(input.len()));
        prop_assert!(base64::is_valid(&text));
        prop_assert_eq!(base64::decoded_len(&text).expect("编码结果长度合法"), input.len());
        let decoded = base64::decode(&text).expect("编码结果必然可解码");
        prop_assert_eq!(decoded, input);
    }

    /// `is_valid` 为真当且仅当 `decode` 成功。
    #[test]
    fn validity_matches_decode(text in "[A-Za-z0-9+/=\\-_ ]{0,64}") {
        prop_assert_eq!(base64::is_valid(&text), base64::decode(&text).is_ok());
    }

    /// 在合法文本中替换一个非字母表字符，解码必须失败并指出该位置。
    #[test]
    fn foreign_byte_is_reported_at_its_position(
        input in prop::collection::vec(any::<u8>(), 3..300),
        offset in any::<prop::sample::Index>(),
        foreign in prop::sample::select(vec![b'-', b'_', b' ', b'*', b'\n']),
    ) {
        let mut text = base64::encode(&input).into_bytes();
        let body = text.iter().position(|&b| b == b'=').unwrap_or(text.len());
        let position = offset.index(body);
        text[position] = foreign;
        let text = String::from_utf8(text).expect("替换字符均为 ASCII");
        prop_assert!(!base64::is_valid(&text));
        match base64::decode(&text) {
            Err(Error::InvalidChar { position: reported, byte }) => {
                prop_assert_eq!(reported, position);
                prop_assert_eq!(byte, foreign);
            }
            other => prop_assert!(false, "期望 InvalidChar，实际 {:?}", other),
        }
    }
}

#[test]
fn alphabet_round_trips_through_decode() {
    let bytes = base64::decode(ALPHABET).expect("完整字母表是合法文本");
    assert_eq!(bytes.len(), 48);
    assert_eq!(base64::encode(&bytes), ALPHABET);
}
