//! Commitment domain: an incrementally updatable set commitment over accounts and storage.
//!
//! Every touched state key owns a leaf `keccak256(tag ++ key ++ value)`; the root folds leaves
//! by XOR, so an update replaces `old_leaf ^ new_leaf` in O(1) and replaying any write
//! sequence reproduces the same root. Leaf records stored in the commitment domain embed a
//! [`KeyRef`] to the state key they attest: plain bytes when freshly built, or a row
//! coordinate into the referenced domain's values file after a merge squeezed them. The merge
//! value transformer rewrites those coordinates against the freshly merged accounts/storage
//! files.

use crate::{
    files::{FileItem, StepRange},
    DomainId, StateError, StateResult,
};
use alloy_primitives::{keccak256, B256};
use std::sync::Arc;

/// Reserved key of the persisted commitment state record.
pub const COMMITMENT_STATE_KEY: &[u8] = b"state";

const REF_PLAIN: u8 = 0;
const REF_FILE: u8 = 1;

/// Domain tag folded into every leaf and prefixed to commitment-domain keys.
pub(crate) const fn domain_tag(id: DomainId) -> u8 {
    id as u8
}

pub(crate) fn tagged_key(id: DomainId, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(domain_tag(id));
    out.extend_from_slice(key);
    out
}

pub(crate) fn leaf_hash(id: DomainId, key: &[u8], value: &[u8]) -> B256 {
    let mut buf = Vec::with_capacity(1 + key.len() + value.len());
    buf.push(domain_tag(id));
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    keccak256(&buf)
}

pub(crate) fn xor_fold(root: &mut B256, leaf: &B256) {
    for (out, byte) in root.0.iter_mut().zip(leaf.0.iter()) {
        *out ^= byte;
    }
}

/// Reference to the state key a commitment leaf attests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRef {
    /// The key itself.
    Plain(Vec<u8>),
    /// Row coordinate inside the referenced domain's values file of `range`.
    File { range: StepRange, row: u64 },
}

/// A decoded commitment leaf record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommitmentValue {
    pub(crate) referenced: KeyRef,
    pub(crate) hash: B256,
}

impl CommitmentValue {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match &self.referenced {
            KeyRef::Plain(key) => {
                out.push(REF_PLAIN);
                out.extend_from_slice(&(key.len() as u32).to_be_bytes());
                out.extend_from_slice(key);
            }
            KeyRef::File { range, row } => {
                out.push(REF_FILE);
                out.extend_from_slice(&range.from_step.to_be_bytes());
                out.extend_from_slice(&range.to_step.to_be_bytes());
                out.extend_from_slice(&row.to_be_bytes());
            }
        }
        out.extend_from_slice(self.hash.as_slice());
        out
    }

    pub(crate) fn decode(raw: &[u8]) -> StateResult<Self> {
        let corrupt = || StateError::Corrupt("malformed commitment value".to_string());
        let (&kind, rest) = raw.split_first().ok_or_else(corrupt)?;
        let (referenced, rest) = match kind {
            REF_PLAIN => {
                let (len, rest) = rest.split_at_checked(4).ok_or_else(corrupt)?;
                let len = u32::from_be_bytes(len.try_into().expect("4 bytes")) as usize;
                let (key, rest) = rest.split_at_checked(len).ok_or_else(corrupt)?;
                (KeyRef::Plain(key.to_vec()), rest)
            }
            REF_FILE => {
                let (coords, rest) = rest.split_at_checked(24).ok_or_else(corrupt)?;
                let from_step = u64::from_be_bytes(coords[0..8].try_into().expect("8 bytes"));
                let to_step = u64::from_be_bytes(coords[8..16].try_into().expect("8 bytes"));
                let row = u64::from_be_bytes(coords[16..24].try_into().expect("8 bytes"));
                (KeyRef::File { range: StepRange::new(from_step, to_step), row }, rest)
            }
            _ => return Err(corrupt()),
        };
        let hash: [u8; 32] = rest.try_into().map_err(|_| corrupt())?;
        Ok(Self { referenced, hash: B256::from(hash) })
    }
}

/// Persisted commitment state: root plus the resumption point for `seek_commitment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommitmentState {
    pub(crate) root: B256,
    pub(crate) tx_num: u64,
    pub(crate) block_num: u64,
}

impl CommitmentState {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48);
        out.extend_from_slice(self.root.as_slice());
        out.extend_from_slice(&self.tx_num.to_be_bytes());
        out.extend_from_slice(&self.block_num.to_be_bytes());
        out
    }

    pub(crate) fn decode(raw: &[u8]) -> StateResult<Self> {
        if raw.len() != 48 {
            return Err(StateError::Corrupt("malformed commitment state".to_string()))
        }
        Ok(Self {
            root: B256::from_slice(&raw[0..32]),
            tx_num: u64::from_be_bytes(raw[32..40].try_into().expect("8 bytes")),
            block_num: u64::from_be_bytes(raw[40..48].try_into().expect("8 bytes")),
        })
    }
}

/// Decodes a stored commitment leaf into its key reference and leaf hash.
pub fn decode_leaf(raw: &[u8]) -> StateResult<(KeyRef, B256)> {
    let value = CommitmentValue::decode(raw)?;
    Ok((value.referenced, value.hash))
}

/// Rewrites one commitment value during a merge.
pub(crate) type ValueTransformer =
    Box<dyn Fn(&[u8], &[u8]) -> StateResult<Vec<u8>> + Send + Sync>;

/// Builds the commitment merge transformer.
///
/// `old_*` are the pre-merge values files the stored coordinates may point into; `new_*` are
/// the freshly merged (or already existing matching) files coordinates are rewritten against.
/// A referenced key absent from the new file keeps its plain form.
pub(crate) fn commitment_value_transform(
    old_accounts: Vec<Arc<FileItem>>,
    old_storage: Vec<Arc<FileItem>>,
    new_accounts: Option<Arc<FileItem>>,
    new_storage: Option<Arc<FileItem>>,
) -> ValueTransformer {
    let resolve_old = move |id: DomainId, range: StepRange, row: u64| -> StateResult<Vec<u8>> {
        let pool = match id {
            DomainId::Accounts => &old_accounts,
            DomainId::Storage => &old_storage,
            _ => {
                return Err(StateError::Corrupt(format!(
                    "commitment leaf references domain {id:?}"
                )))
            }
        };
        let item = pool.iter().find(|item| item.range == range).ok_or_else(|| {
            StateError::Corrupt(format!("referenced {id:?} file {range} is not a merge source"))
        })?;
        Ok(item.segment.pair_at(row)?.0)
    };

    Box::new(move |ckey: &[u8], value: &[u8]| -> StateResult<Vec<u8>> {
        // Deleted leaves are stored as the empty value and the state marker is no leaf at
        // all; both pass through untouched.
        if value.is_empty() || ckey == COMMITMENT_STATE_KEY {
            return Ok(value.to_vec())
        }
        let Some(&tag) = ckey.first() else {
            return Err(StateError::Corrupt("empty commitment key".to_string()))
        };
        let id = match tag {
            0 => DomainId::Accounts,
            1 => DomainId::Storage,
            _ => return Ok(value.to_vec()),
        };
        let decoded = CommitmentValue::decode(value)?;
        let plain = match &decoded.referenced {
            KeyRef::Plain(key) => key.clone(),
            KeyRef::File { range, row } => resolve_old(id, *range, *row)?,
        };
        let target = match id {
            DomainId::Accounts => new_accounts.as_ref(),
            _ => new_storage.as_ref(),
        };
        let referenced = match target {
            Some(item) => match item.segment.lookup_row(&plain)? {
                Some(row) => KeyRef::File { range: item.range, row },
                None => KeyRef::Plain(plain),
            },
            None => KeyRef::Plain(plain),
        };
        Ok(CommitmentValue { referenced, hash: decoded.hash }.encode())
    })
}

/// Resolves the state key a stored commitment leaf references, for reads and integrity checks.
pub(crate) fn resolve_key_ref(
    referenced: &KeyRef,
    id: DomainId,
    files: &[Arc<FileItem>],
) -> StateResult<Vec<u8>> {
    match referenced {
        KeyRef::Plain(key) => Ok(key.clone()),
        KeyRef::File { range, row } => {
            let item = files.iter().find(|item| item.range == *range).ok_or_else(|| {
                StateError::Corrupt(format!("referenced {id:?} file {range} is not visible"))
            })?;
            Ok(item.segment.pair_at(*row)?.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_roundtrip_plain() {
        let value = CommitmentValue {
            referenced: KeyRef::Plain(b"some account".to_vec()),
            hash: keccak256(b"x"),
        };
        assert_eq!(CommitmentValue::decode(&value.encode()).unwrap(), value);
    }

    #[test]
    fn leaf_roundtrip_file_ref() {
        let value = CommitmentValue {
            referenced: KeyRef::File { range: StepRange::new(0, 2), row: 17 },
            hash: keccak256(b"y"),
        };
        assert_eq!(CommitmentValue::decode(&value.encode()).unwrap(), value);
    }

    #[test]
    fn state_roundtrip() {
        let state =
            CommitmentState { root: keccak256(b"root"), tx_num: 2000, block_num: 200 };
        assert_eq!(CommitmentState::decode(&state.encode()).unwrap(), state);
        assert!(CommitmentState::decode(&[0; 47]).is_err());
    }

    #[test]
    fn xor_fold_is_its_own_inverse() {
        let mut root = B256::ZERO;
        let leaf = keccak256(b"leaf");
        xor_fold(&mut root, &leaf);
        assert_eq!(root, leaf);
        xor_fold(&mut root, &leaf);
        assert_eq!(root, B256::ZERO);
    }
}
