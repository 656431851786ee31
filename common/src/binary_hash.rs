use std::{env, fs::File, io, path::Path};

use sha2::{Digest, Sha256};

/// SHA-256 of the file at `path`, lowercase hex.
pub fn binary_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of the running executable.
pub fn current_binary_hash() -> io::Result<String> {
    binary_hash(&env::current_exe()?)
}
