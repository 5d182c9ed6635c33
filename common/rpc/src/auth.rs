//! Per-connection challenge/response authentication using a keyed Blake2b MAC.

use blake2::digest::{FixedOutput, Mac, Update};
use blake2::Blake2bMac512;
use rand::RngCore;
use subtle::ConstantTimeEq;

pub const CHALLENGE_SIZE: usize = 16;
pub const AUTH_KEY_SIZE: usize = 16;
const AUTH_DOMAIN: &[u8] = b"validator-supervisor/rpc-auth/v1";

/// A fresh per-user shared auth key, hex-encoded.
pub fn gen_user_key() -> String {
    hex::encode(random_bytes(AUTH_KEY_SIZE))
}

/// A fresh per-connection challenge, hex-encoded.
pub fn gen_auth_challenge() -> String {
    hex::encode(random_bytes(CHALLENGE_SIZE))
}

/// The expected response to `challenge` for a user holding `key` (both hex-encoded).
pub fn auth_response(key: &str, challenge: &str) -> String {
    let mut mac = Blake2bMac512::new_from_slice(key.as_bytes()).expect("key is a valid MAC key");
    Update::update(&mut mac, AUTH_DOMAIN);
    Update::update(&mut mac, challenge.as_bytes());
    hex::encode(mac.finalize_fixed())
}

/// Constant-time check of a claimed `response` to `challenge` under `key`.
pub fn check_auth_response(key: &str, challenge: &str, response: &str) -> bool {
    let expected = auth_response(key, challenge);
    expected.as_bytes().ct_eq(response.as_bytes()).into()
}

fn random_bytes(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_response_is_deterministic_and_key_dependent() {
        let key = gen_user_key();
        let challenge = gen_auth_challenge();
        let a = auth_response(&key, &challenge);
        let b = auth_response(&key, &challenge);
        assert_eq!(a, b);

        let other_key = gen_user_key();
        let c = auth_response(&other_key, &challenge);
        assert_ne!(a, c);
    }

    #[test]
    fn check_auth_response_rejects_wrong_response() {
        let key = gen_user_key();
        let challenge = gen_auth_challenge();
        assert!(!check_auth_response(&key, &challenge, "deadbeef"));
        let response = auth_response(&key, &challenge);
        assert!(check_auth_response(&key, &challenge, &response));
    }
}
