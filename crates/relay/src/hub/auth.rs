// Subscriber secret verification.
//
// Both sides are hashed before comparison so the comparison length is
// fixed, then compared without early exit.

use sha2::{Digest, Sha256};

fn hash_secret(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// True when `presented` matches `expected`. Empty secrets never match.
pub fn secrets_match(presented: &str, expected: &str) -> bool {
    if presented.is_empty() || expected.is_empty() {
        return false;
    }
    let presented = hash_secret(presented);
    let expected = hash_secret(expected);
    presented.iter().zip(expected.iter()).fold(0u8, |diff, (a, b)| diff | (a ^ b)) == 0
}
