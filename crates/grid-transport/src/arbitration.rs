//! Decides which side of a host pair dials the other

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const PAIR_SALT: &[u8] = b"grid-link";

fn fnv1a(mut hash: u64, data: &[u8]) -> u64 {
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Murmur3 finalizer, spreads FNV output over all bits
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Whether `local` should dial `remote`.
///
/// The pair hash is the same from both ends, the lexical comparison is not,
/// so for `local != remote` exactly one side gets `true`.
pub fn should_connect(local: &str, remote: &str) -> bool {
    let (low, high) = if local < remote {
        (local, remote)
    } else {
        (remote, local)
    };

    let mut hash = fnv1a(FNV_OFFSET, PAIR_SALT);
    hash = fnv1a(hash, low.as_bytes());
    hash = fnv1a(hash, &[0]);
    hash = fnv1a(hash, high.as_bytes());

    let pair_bit = fmix64(hash) & 1 == 1;
    pair_bit ^ (local < remote)
}
