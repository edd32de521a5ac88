use sha2::{Digest, Sha256};

/// バイト列のSHA256ハッシュを16進数文字列として計算する
///
/// アップロードされたドキュメントの内容ハッシュとして使用され、
/// 同一内容の再アップロード検知やエクスポートの検証に利用できます。
pub fn hash_bytes(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_bytes_consistency() {
        let input = b"calibration certificate v2";
        let hash = hash_bytes(input);

        // SHA256は64文字の16進数文字列を生成する
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        // 同じ入力は常に同じハッシュを生成
        for _ in 0..10 {
            assert_eq!(hash, hash_bytes(input));
        }
    }

    #[test]
    fn test_hash_bytes_differs_by_input() {
        // 異なる入力は異なるハッシュを生成
        assert_ne!(hash_bytes(b"manual-rev-a.pdf"), hash_bytes(b"manual-rev-b.pdf"));
    }
}
