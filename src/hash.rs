//! Streaming checksums over file ranges.
//!
//! Glacier authenticates every part with two digests computed over the same
//! bytes: a plain SHA-256 (`linear`) and a binary Merkle tree over 1 MiB
//! leaves (`tree`). Both are produced in a single pass that never holds more
//! than one 1 MiB chunk plus O(log n) intermediate digests, so memory stays
//! flat no matter how large the part is. B2 only needs a SHA-1 per part.
//!
//! See <https://docs.aws.amazon.com/amazonglacier/latest/dev/checksum-calculations.html>
//! for the tree hash definition.

use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// Tree hash leaf size. Fixed by the Glacier protocol, not tunable.
pub const LEAF_SIZE: u64 = 1024 * 1024;

/// SHA-256 digest of the concatenation `left ‖ right`.
fn combine(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Online builder for the Glacier SHA-256 tree hash.
///
/// Leaves are pushed in order; whenever the two topmost stack entries sit at
/// the same tree level they are merged immediately, so at most
/// ⌈log₂(leaves)⌉ digests are retained at any point. `finish` folds whatever
/// remains (the odd tail carries upward unchanged, matching the pairwise
/// definition).
#[derive(Debug, Default)]
pub struct TreeHasher {
    stack: Vec<(u32, [u8; 32])>,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the SHA-256 digest of the next 1 MiB leaf.
    pub fn push_leaf(&mut self, digest: [u8; 32]) {
        self.stack.push((1, digest));
        while self.stack.len() >= 2 {
            let (rl, _) = self.stack[self.stack.len() - 1];
            let (ll, _) = self.stack[self.stack.len() - 2];
            if rl != ll {
                break;
            }
            let (_, right) = self.stack.pop().expect("stack len checked");
            let (_, left) = self.stack.pop().expect("stack len checked");
            self.stack.push((ll + 1, combine(&left, &right)));
        }
    }

    /// Fold the remaining stack into the root digest.
    ///
    /// An empty builder hashes the empty input, mirroring what Glacier
    /// documents for a zero-length payload.
    pub fn finish(mut self) -> [u8; 32] {
        if self.stack.is_empty() {
            return Sha256::digest(b"").into();
        }
        while self.stack.len() >= 2 {
            let (_, right) = self.stack.pop().expect("stack len checked");
            let (_, left) = self.stack.pop().expect("stack len checked");
            // Levels no longer matter: the tail pairs with whatever is left.
            self.stack.push((0, combine(&left, &right)));
        }
        self.stack[0].1
    }
}

/// Fold an ordered vector of per-part tree hashes into the archive root.
///
/// Same pairwise rule as within a part: adjacent digests combine, an odd
/// tail carries forward unchanged to the next level.
pub fn compose(hashes: &[[u8; 32]]) -> [u8; 32] {
    if hashes.is_empty() {
        return Sha256::digest(b"").into();
    }
    let mut level: Vec<[u8; 32]> = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => combine(left, right),
                [last] => *last,
                _ => unreachable!("chunks(2) yields 1 or 2 items"),
            })
            .collect();
    }
    level[0]
}

/// Both Glacier digests for one byte range, computed in a single pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeDigests {
    /// SHA-256 binary tree hash over 1 MiB leaves.
    pub tree: [u8; 32],
    /// SHA-256 of the entire range.
    pub linear: [u8; 32],
}

/// Read `[start, end]` (inclusive) of `path` once, returning tree and linear
/// SHA-256 digests. Reads in 1 MiB chunks; each chunk read is an await point
/// so long ranges do not starve the runtime.
pub async fn digest_range(path: &Path, start: u64, end: u64) -> io::Result<RangeDigests> {
    let mut linear = Sha256::new();
    let mut tree = TreeHasher::new();
    stream_range(path, start, end, |chunk| {
        linear.update(chunk);
        tree.push_leaf(Sha256::digest(chunk).into());
    })
    .await?;
    Ok(RangeDigests {
        tree: tree.finish(),
        linear: linear.finalize().into(),
    })
}

/// SHA-1 of `[start, end]` (inclusive) of `path`, streamed in 1 MiB chunks.
pub async fn sha1_range(path: &Path, start: u64, end: u64) -> io::Result<[u8; 20]> {
    let mut hasher = Sha1::new();
    stream_range(path, start, end, |chunk| hasher.update(chunk)).await?;
    Ok(hasher.finalize().into())
}

/// Feed each full-or-final 1 MiB chunk of the inclusive range to `sink`.
async fn stream_range(
    path: &Path,
    start: u64,
    end: u64,
    mut sink: impl FnMut(&[u8]),
) -> io::Result<()> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;

    let mut remaining = end - start + 1;
    let mut buf = vec![0u8; LEAF_SIZE as usize];
    while remaining > 0 {
        let want = remaining.min(LEAF_SIZE) as usize;
        // A single read may come back short; keep going until the chunk is
        // full or the file ends early (which is an error for a fixed range).
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut buf[filled..want]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("file ended {} bytes short of range {}-{}", want - filled, start, end),
                ));
            }
            filled += n;
        }
        sink(&buf[..want]);
        remaining -= want as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Pairwise reference from the Glacier documentation: hash every chunk,
    /// then repeatedly combine adjacent digests until one remains.
    fn reference_tree(data: &[u8], chunk_size: usize) -> [u8; 32] {
        let mut hashes: Vec<[u8; 32]> = data
            .chunks(chunk_size)
            .map(|c| Sha256::digest(c).into())
            .collect();
        if hashes.is_empty() {
            hashes.push(Sha256::digest(b"").into());
        }
        compose(&hashes)
    }

    fn stack_tree(data: &[u8], chunk_size: usize) -> [u8; 32] {
        let mut tree = TreeHasher::new();
        for chunk in data.chunks(chunk_size) {
            tree.push_leaf(Sha256::digest(chunk).into());
        }
        tree.finish()
    }

    #[test]
    fn test_single_leaf_is_plain_sha256() {
        let data = b"hello tree hash";
        let mut tree = TreeHasher::new();
        tree.push_leaf(Sha256::digest(data).into());
        let expected: [u8; 32] = Sha256::digest(data).into();
        assert_eq!(tree.finish(), expected);
    }

    #[test]
    fn test_stack_matches_pairwise_reference() {
        // Leaf counts around every interesting boundary: powers of two,
        // odd tails, and a lone leaf.
        let data: Vec<u8> = (0..=255u8).cycle().take(13 * 64).collect();
        for leaves in 1..=13 {
            let slice = &data[..leaves * 64];
            assert_eq!(
                stack_tree(slice, 64),
                reference_tree(slice, 64),
                "mismatch at {} leaves",
                leaves
            );
        }
    }

    #[test]
    fn test_five_leaf_structure() {
        // 5 leaves fold as ((12)(34))(5): the odd tail pairs at the end.
        let leaves: Vec<[u8; 32]> = (0u8..5).map(|i| Sha256::digest([i]).into()).collect();
        let n12 = combine(&leaves[0], &leaves[1]);
        let n34 = combine(&leaves[2], &leaves[3]);
        let expected = combine(&combine(&n12, &n34), &leaves[4]);

        let mut tree = TreeHasher::new();
        for leaf in &leaves {
            tree.push_leaf(*leaf);
        }
        assert_eq!(tree.finish(), expected);
        assert_eq!(compose(&leaves), expected);
    }

    #[test]
    fn test_compose_single_hash_is_identity() {
        let h: [u8; 32] = Sha256::digest(b"only part").into();
        assert_eq!(compose(&[h]), h);
    }

    #[test]
    fn test_compose_two_parts() {
        let a: [u8; 32] = Sha256::digest(b"part 0").into();
        let b: [u8; 32] = Sha256::digest(b"part 1").into();
        assert_eq!(compose(&[a, b]), combine(&a, &b));
    }

    #[tokio::test]
    async fn test_digest_range_crosses_leaf_boundary() {
        // 1 MiB + 1 byte: two leaves, second a single byte.
        let size = LEAF_SIZE as usize + 1;
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();

        let digests = digest_range(tmp.path(), 0, size as u64 - 1).await.unwrap();

        let expected_linear: [u8; 32] = Sha256::digest(&data).into();
        assert_eq!(digests.linear, expected_linear);
        assert_eq!(digests.tree, reference_tree(&data, LEAF_SIZE as usize));
    }

    #[tokio::test]
    async fn test_digest_range_subrange_only() {
        let data = vec![7u8; 4096];
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();

        // Bytes 1024..=3071 only.
        let digests = digest_range(tmp.path(), 1024, 3071).await.unwrap();
        let expected: [u8; 32] = Sha256::digest(&data[1024..3072]).into();
        assert_eq!(digests.linear, expected);
        // Whole subrange fits in one leaf, so tree == linear.
        assert_eq!(digests.tree, expected);
    }

    #[tokio::test]
    async fn test_digest_range_past_eof_is_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 100]).unwrap();
        let err = digest_range(tmp.path(), 0, 199).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_sha1_range() {
        let data = b"backblaze wants sha1".to_vec();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();

        let digest = sha1_range(tmp.path(), 0, data.len() as u64 - 1).await.unwrap();
        let expected: [u8; 20] = Sha1::digest(&data).into();
        assert_eq!(digest, expected);
    }
}
