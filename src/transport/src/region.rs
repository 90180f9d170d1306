use rdma::fabric::RemoteKey;

use crate::error::{Error, Result};

/// A registered region a peer may write into, as advertised over the wire.
///
/// Encoded as 16 little-endian bytes: address (8), remote key (4), length (4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteRegion {
    pub addr: u64,
    pub rkey: u32,
    pub len: u32,
}

impl RemoteRegion {
    pub const ENCODED_LEN: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.rkey.to_le_bytes());
        out[12..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; Self::ENCODED_LEN] = bytes
            .get(..Self::ENCODED_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(Error::MalformedRegion(bytes.len()))?;
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&bytes[..8]);
        let mut rkey = [0u8; 4];
        rkey.copy_from_slice(&bytes[8..12]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[12..]);
        Ok(RemoteRegion {
            addr: u64::from_le_bytes(addr),
            rkey: u32::from_le_bytes(rkey),
            len: u32::from_le_bytes(len),
        })
    }

    #[inline]
    pub fn remote_key(&self) -> RemoteKey {
        RemoteKey {
            addr: self.addr,
            rkey: self.rkey,
        }
    }
}
