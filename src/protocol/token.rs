//! # Token Validation Boundary
//!
//! The handshake never touches ciphers directly. It consumes a [`TokenCodec`]
//! that can open connect tokens, mint challenge tokens and compare challenge
//! echoes.
//!
//! [`ChaChaTokenCodec`] is the reference implementation: ChaCha20-Poly1305
//! with the token's expiry bound in as associated data, so a request whose
//! plaintext `expire_timestamp` was edited fails authentication.
//!
//! ## Connect Token Layout (plaintext, before sealing)
//! ```text
//! [client_id: u64 LE] [user_data: USER_DATA_BYTES] [zero padding] -> + 16 byte tag = CONNECT_TOKEN_BYTES
//! ```
//! Associated data: `[PROTOCOL_VERSION] [expire_timestamp: u64 LE]`.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use tracing::{debug, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{
    CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_BYTES, KEY_BYTES, MAC_BYTES, NONCE_BYTES,
    PROTOCOL_VERSION, USER_DATA_BYTES,
};
use crate::error::{constants, ProtocolError, Result};

/// Encrypted connect token as carried by a ConnectionRequest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToken {
    /// Absolute expiry, unix seconds
    pub expire_timestamp: u64,
    pub data: [u8; CONNECT_TOKEN_BYTES],
    pub nonce: [u8; NONCE_BYTES],
}

/// Encrypted challenge token as carried by Challenge / ChallengeResponse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeToken {
    pub data: [u8; CHALLENGE_TOKEN_BYTES],
    pub nonce: [u8; NONCE_BYTES],
}

/// What the server learns from a successfully opened connect token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPrivateInfo {
    pub client_id: u64,
    pub user_data: [u8; USER_DATA_BYTES],
}

impl ClientPrivateInfo {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            user_data: [0; USER_DATA_BYTES],
        }
    }
}

/// Contract the handshake requires from the token cryptography
pub trait TokenCodec {
    /// Authenticate and decrypt a connect token.
    ///
    /// Fails with [`ProtocolError::TokenExpired`] when `expire_timestamp < now`
    /// and with [`ProtocolError::TokenInvalid`] when authentication fails.
    fn decrypt_connect_token(&self, token: &ConnectToken, now: u64) -> Result<ClientPrivateInfo>;

    /// Mint a fresh challenge token. The nonce must never repeat.
    fn issue_challenge_token(&mut self, info: &ClientPrivateInfo) -> Result<ChallengeToken>;

    /// Byte-exact comparison of a challenge echo against what was issued
    fn verify_challenge_response(&self, sent: &ChallengeToken, received: &ChallengeToken) -> bool {
        sent.nonce == received.nonce && sent.data == received.data
    }
}

fn connect_token_aad(expire_timestamp: u64) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[0] = PROTOCOL_VERSION;
    aad[1..].copy_from_slice(&expire_timestamp.to_le_bytes());
    aad
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::fill(&mut buf)
        .map_err(|_| ProtocolError::EncryptionFailure(constants::ERR_RANDOM_SOURCE))?;
    Ok(buf)
}

/// Seal `buf[..len - MAC_BYTES]` in place and append the tag
fn seal(key: &[u8; KEY_BYTES], nonce: &[u8; NONCE_BYTES], aad: &[u8], buf: &mut [u8]) -> Result<()> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let (body, mac) = buf.split_at_mut(buf.len() - MAC_BYTES);
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, body)
        .map_err(|_| ProtocolError::EncryptionFailure(constants::ERR_TOKEN_SEAL))?;
    mac.copy_from_slice(&tag);
    Ok(())
}

/// Open a buffer produced by [`seal`]; returns the plaintext body
fn open(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    aad: &[u8],
    sealed: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let (body, mac) = sealed.split_at(sealed.len() - MAC_BYTES);
    let mut plain = body.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            &mut plain,
            Tag::from_slice(mac),
        )
        .map_err(|_| ProtocolError::TokenInvalid)?;
    Ok(plain)
}

/// Matchmaker side: mint a connect token for `client_id` under the shared key
pub fn generate_connect_token(
    private_key: &[u8; KEY_BYTES],
    client_id: u64,
    user_data: &[u8; USER_DATA_BYTES],
    expire_timestamp: u64,
) -> Result<ConnectToken> {
    let nonce = random_bytes::<NONCE_BYTES>()?;

    let mut data = [0u8; CONNECT_TOKEN_BYTES];
    data[..8].copy_from_slice(&client_id.to_le_bytes());
    data[8..8 + USER_DATA_BYTES].copy_from_slice(user_data);
    seal(private_key, &nonce, &connect_token_aad(expire_timestamp), &mut data)?;

    Ok(ConnectToken {
        expire_timestamp,
        data,
        nonce,
    })
}

/// Generate a random token key
pub fn generate_key() -> Result<[u8; KEY_BYTES]> {
    random_bytes::<KEY_BYTES>()
}

/// ChaCha20-Poly1305 token codec
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChaChaTokenCodec {
    private_key: [u8; KEY_BYTES],
    challenge_key: [u8; KEY_BYTES],
    challenge_sequence: u64,
}

impl std::fmt::Debug for ChaChaTokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaTokenCodec")
            .field("challenge_sequence", &self.challenge_sequence)
            .finish_non_exhaustive()
    }
}

impl ChaChaTokenCodec {
    /// Codec sharing `private_key` with the matchmaker. The challenge key is
    /// random per instance, so challenges never survive a server restart.
    pub fn new(private_key: [u8; KEY_BYTES]) -> Result<Self> {
        Ok(Self {
            private_key,
            challenge_key: generate_key()?,
            challenge_sequence: 0,
        })
    }

    /// Recover the client id sealed in a challenge token this codec issued
    pub fn open_challenge_token(&self, token: &ChallengeToken) -> Result<u64> {
        let plain = open(&self.challenge_key, &token.nonce, &[], &token.data)?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&plain[..8]);
        Ok(u64::from_le_bytes(id))
    }
}

impl TokenCodec for ChaChaTokenCodec {
    #[instrument(skip(self, token), fields(expire = token.expire_timestamp))]
    fn decrypt_connect_token(&self, token: &ConnectToken, now: u64) -> Result<ClientPrivateInfo> {
        if token.expire_timestamp < now {
            return Err(ProtocolError::TokenExpired(token.expire_timestamp));
        }

        let plain = open(
            &self.private_key,
            &token.nonce,
            &connect_token_aad(token.expire_timestamp),
            &token.data,
        )
        .inspect_err(|_| debug!("{}", constants::ERR_TOKEN_AUTH))?;

        let mut id = [0u8; 8];
        id.copy_from_slice(&plain[..8]);
        let mut info = ClientPrivateInfo::new(u64::from_le_bytes(id));
        info.user_data.copy_from_slice(&plain[8..8 + USER_DATA_BYTES]);
        Ok(info)
    }

    fn issue_challenge_token(&mut self, info: &ClientPrivateInfo) -> Result<ChallengeToken> {
        self.challenge_sequence += 1;
        let mut nonce = [0u8; NONCE_BYTES];
        nonce[..8].copy_from_slice(&self.challenge_sequence.to_le_bytes());

        let mut data = [0u8; CHALLENGE_TOKEN_BYTES];
        data[..8].copy_from_slice(&info.client_id.to_le_bytes());
        seal(&self.challenge_key, &nonce, &[], &mut data)?;

        Ok(ChallengeToken { data, nonce })
    }
}
