//! Deploying identity and legacy (EIP-155) transaction signing.

use std::fmt;
use std::str::FromStr;

use alloy_core::primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_core::rlp::{Encodable, Header};
use alloy_signer_local::PrivateKeySigner;

use crate::error::{DeployError, Result};

/// Fields of a transaction before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    /// `None` creates a contract.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
}

/// A signed transaction ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hash: B256,
    pub from: Address,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub data: Bytes,
    /// RLP encoding handed to `eth_sendRawTransaction`.
    pub raw: Bytes,
}

/// The key that signs every transaction of a run.
pub struct DeployerIdentity {
    signer: PrivateKeySigner,
}

impl fmt::Debug for DeployerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployerIdentity")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl DeployerIdentity {
    /// Parse a hex private key. The key is never echoed in errors.
    pub fn from_private_key(key: &str) -> Result<Self> {
        let signer = PrivateKeySigner::from_str(key.trim())
            .map_err(|_| DeployError::config("deployer private key is not a valid secp256k1 key"))?;
        Ok(Self { signer })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn sign(&self, tx: &TxRequest, chain_id: u64) -> Result<SignedTransaction> {
        let sighash = keccak256(signing_payload(tx, chain_id));
        let (r, s, recovery) = self.sign_hash(&sighash)?;
        let v = u64::from(recovery) + 35 + 2 * chain_id;

        let to = encode_to(tx.to);
        let raw = encode_list(&[
            &tx.nonce,
            &tx.gas_price,
            &tx.gas_limit,
            &to,
            &tx.value,
            &tx.data,
            &v,
            &r,
            &s,
        ]);

        Ok(SignedTransaction {
            hash: keccak256(&raw),
            from: self.address(),
            nonce: tx.nonce,
            gas_price: tx.gas_price,
            gas_limit: tx.gas_limit,
            to: tx.to,
            data: tx.data.clone(),
            raw: raw.into(),
        })
    }

    fn sign_hash(&self, hash: &B256) -> Result<(U256, U256, u8)> {
        let (signature, recovery) = self
            .signer
            .credential()
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| DeployError::Submission(format!("failed to sign transaction: {e}")))?;
        let bytes = signature.to_bytes();
        Ok((
            U256::from_be_slice(&bytes[..32]),
            U256::from_be_slice(&bytes[32..]),
            recovery.to_byte(),
        ))
    }
}

/// The EIP-155 preimage: the unsigned fields followed by `chain_id, 0, 0`.
pub fn signing_payload(tx: &TxRequest, chain_id: u64) -> Vec<u8> {
    let to = encode_to(tx.to);
    encode_list(&[
        &tx.nonce,
        &tx.gas_price,
        &tx.gas_limit,
        &to,
        &tx.value,
        &tx.data,
        &chain_id,
        &0u8,
        &0u8,
    ])
}

fn encode_to(to: Option<Address>) -> Bytes {
    to.map(|address| Bytes::copy_from_slice(address.as_slice()))
        .unwrap_or_default()
}

fn encode_list(fields: &[&dyn Encodable]) -> Vec<u8> {
    let payload_length = fields.iter().map(|field| field.length()).sum();
    let mut out = Vec::with_capacity(payload_length + 9);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    for field in fields {
        field.encode(&mut out);
    }
    out
}
