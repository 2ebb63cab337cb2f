// Rolling integrity digest over descriptor metadata blocks.
//
// This is a DJB2-style fold for catching accidental corruption, not a
// security primitive: it offers no resistance to deliberate tampering. Hosts
// that need to trust module provenance must layer a cryptographic check at
// the distribution boundary.

/// Folds whole little-endian 32-bit words as `hash = (hash * 33) ^ word`.
///
/// A trailing partial word is ignored. That truncation is part of the wire
/// contract: descriptor blocks are word-aligned, so nothing is lost there,
/// and arbitrary inputs hash only their word-aligned prefix.
pub fn digest(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for word in bytes.chunks_exact(4) {
        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        hash = (hash.wrapping_shl(5).wrapping_add(hash)) ^ word;
    }
    hash
}

/// True iff `digest(bytes)` equals the declared value.
pub fn verify(bytes: &[u8], declared: u32) -> bool {
    digest(bytes) == declared
}
