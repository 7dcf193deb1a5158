use md5::{Digest, Md5};

/// Locally administered QEMU-range MAC derived from `seed`.
pub fn get_mac(seed: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(seed.as_bytes());
    let hash = hasher.finalize();
    format!(
        "52:54:{:02x}:{:02x}:{:02x}:{:02x}",
        hash[0], hash[1], hash[2], hash[3]
    )
}
