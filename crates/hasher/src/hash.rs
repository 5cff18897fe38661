use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::{HASH_BUFFER_SIZE, HashAlgorithm, HashError};

/// Hex digest tagged with the algorithm that produced it.
///
/// Digests from different algorithms never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    algorithm: HashAlgorithm,
    hex: String,
}

impl ContentDigest {
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn as_hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Hashes everything readable from `reader`.
///
/// Returns the digest and the number of bytes consumed.
pub fn hash_reader<R: Read>(
    mut reader: R,
    algorithm: HashAlgorithm,
) -> Result<(ContentDigest, u64), HashError> {
    let mut hasher = algorithm.hasher();
    let mut buf = [0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    let digest = ContentDigest {
        algorithm,
        hex: hasher.finalize_hex(),
    };
    Ok((digest, total))
}

/// Computes the digest of a file's full contents.
///
/// Blocking; async callers should run it on the blocking pool.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<ContentDigest, HashError> {
    let file = File::open(path)?;
    let (digest, _) = hash_reader(file, algorithm)?;
    Ok(digest)
}
