use std::cmp::Ordering;

/// A 256-bit hash as produced by the search kernel and the host oracle,
/// stored little-endian (most significant word last).
pub type Hash = [u8; 32];

fn le_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    u32::from_le_bytes(word)
}

/// Compares two hashes as 256-bit little-endian integers, most significant
/// u64 word first. A share beats another when its hash is `Less`.
pub fn cmp_hashes(a: &Hash, b: &Hash) -> Ordering {
    for word in (0..4).rev() {
        let start = word * 8;
        let lhs = le_u64(&a[start..start + 8]);
        let rhs = le_u64(&b[start..start + 8]);
        match lhs.cmp(&rhs) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Extracts the two 32-bit threshold words pushed to the device target
/// registers: word 7 (target-high) and word 6 (target-low) of the minimal
/// hash. The kernel only reports nonces whose hash tops fall below these.
pub fn target_words(min_hash: &Hash) -> (u32, u32) {
    (le_u32(&min_hash[28..32]), le_u32(&min_hash[24..28]))
}

pub fn format_hashrate(hps: f64) -> String {
    const UNITS: [&str; 5] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s"];
    let mut value = hps.max(0.0);
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.3} {}", value, UNITS[unit])
}
