//! Signer-tagged signatures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A signature over a block reference together with the identity of its signer.
///
/// The consensus core never inspects the bytes; verification belongs to the
/// storage/execution engine.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Public key (or other identity) of the signer.
    pub subject_id: Vec<u8>,
    /// Raw signature bytes.
    pub data: Vec<u8>,
}

impl Signature {
    pub fn new(subject_id: Vec<u8>, data: Vec<u8>) -> Self {
        Self { subject_id, data }
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subject = hex::encode(&self.subject_id);
        write!(f, "Signature(by {})", &subject[..subject.len().min(8)])
    }
}
