// Save/resume state: logical endpoint configuration only. Ring memory is never
// persisted; restoring binds fresh rings.
//
// Encoding (little-endian):
//   magic:u32 | version:u32 | count:u32 | count * record | sha256(preceding bytes):[u8; 32]
// record:
//   local_domain:u16 | local_port:u32 | remote_domain:u16 | remote_port:u32
//   | direction:u8 | ring_len:u32 | max_payload:u32

use super::error::TransportError;
use super::ports::Addr;
use super::registry::Registry;
use crate::Transport::{Direction, Endpoint, EndpointConfig};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

pub const SNAPSHOT_MAGIC: u32 = 0x5634_5653; // "V4VS"
pub const SNAPSHOT_VERSION: u32 = 1;

const PREAMBLE_LEN: usize = 12;
const RECORD_LEN: usize = 21;
const DIGEST_LEN: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot truncated: {len} bytes")]
    Truncated { len: usize },

    #[error("not a snapshot (magic {0:#010x})")]
    BadMagic(u32),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("snapshot digest mismatch")]
    DigestMismatch,

    #[error("invalid endpoint direction {0}")]
    InvalidDirection(u8),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub endpoints: Vec<EndpointConfig>,
}

impl Snapshot {
    pub fn capture<'a>(endpoints: impl IntoIterator<Item = &'a Endpoint>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(|ep| *ep.config()).collect(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(PREAMBLE_LEN + self.endpoints.len() * RECORD_LEN + DIGEST_LEN);
        out.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.endpoints.len() as u32).to_le_bytes());
        for config in &self.endpoints {
            out.extend_from_slice(&config.local.domain.to_le_bytes());
            out.extend_from_slice(&config.local.port.to_le_bytes());
            out.extend_from_slice(&config.remote.domain.to_le_bytes());
            out.extend_from_slice(&config.remote.port.to_le_bytes());
            out.push(match config.direction {
                Direction::Send => 0,
                Direction::Receive => 1,
            });
            out.extend_from_slice(&(config.ring_len as u32).to_le_bytes());
            out.extend_from_slice(&(config.max_payload as u32).to_le_bytes());
        }
        let digest = Sha256::digest(&out);
        out.extend_from_slice(&digest);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let truncated = SnapshotError::Truncated { len: bytes.len() };
        if bytes.len() < PREAMBLE_LEN + DIGEST_LEN {
            return Err(truncated);
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        let mut reader = Reader(body);

        let magic = reader.u32().ok_or_else(|| truncated.clone())?;
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic(magic));
        }
        let version = reader.u32().ok_or_else(|| truncated.clone())?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        if Sha256::digest(body).as_slice() != digest {
            return Err(SnapshotError::DigestMismatch);
        }

        let count = reader.u32().ok_or_else(|| truncated.clone())? as usize;
        if reader.0.len() != count * RECORD_LEN {
            return Err(truncated);
        }
        let mut endpoints = Vec::with_capacity(count);
        for _ in 0..count {
            let record = (|| {
                let local = Addr::new(reader.u16()?, reader.u32()?);
                let remote = Addr::new(reader.u16()?, reader.u32()?);
                let direction = reader.u8()?;
                Some((local, remote, direction, reader.u32()?, reader.u32()?))
            })();
            let Some((local, remote, direction, ring_len, max_payload)) = record else {
                return Err(truncated);
            };
            let direction = match direction {
                0 => Direction::Send,
                1 => Direction::Receive,
                other => return Err(SnapshotError::InvalidDirection(other)),
            };
            endpoints.push(EndpointConfig {
                local,
                remote,
                direction,
                ring_len: ring_len as usize,
                max_payload: max_payload as usize,
            });
        }
        Ok(Self { endpoints })
    }

    /// Re-open every endpoint with a fresh ring. Receive endpoints are bound before
    /// send endpoints so a snapshot holding both halves of a channel restores in one go.
    pub fn restore(&self, registry: &Arc<Registry>) -> Result<Vec<Endpoint>, TransportError> {
        let mut ordered: Vec<&EndpointConfig> = self.endpoints.iter().collect();
        ordered.sort_by_key(|config| config.direction == Direction::Send);
        let restored = ordered
            .into_iter()
            .map(|config| Endpoint::open(registry.clone(), *config))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(endpoints = restored.len(), "snapshot restored");
        Ok(restored)
    }
}

struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.0.len() < N {
            return None;
        }
        let (head, rest) = self.0.split_at(N);
        self.0 = rest;
        head.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }
}
