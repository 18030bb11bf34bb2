//! CAR archive encoding.
//!
//! An archive is a length-prefixed JSON header followed by length-prefixed
//! sections, each holding the binary CID of a block and the block bytes:
//!
//! ```text
//! varint(len) | {"version":1,"roots":[...]}
//! varint(len) | cid | data
//! ...
//! ```
//!
//! Lengths are unsigned LEB128 varints of at most 10 bytes. Blocks are
//! addressed by CIDv1 with a sha2-256 multihash.

use std::fmt;
use std::io::ErrorKind;
use std::str::FromStr;

use cid::Cid;
use multihash::Multihash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use super::CarError;

/// Only archive version produced and accepted.
pub const CAR_VERSION: u64 = 1;

/// Multicodec of raw binary blocks.
pub const RAW_CODEC: u64 = 0x55;

/// Multihash code of sha2-256.
pub const SHA2_256: u64 = 0x12;

/// Longest valid LEB128 encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Upper bound on the encoded size of a CID inside a section.
pub const MAX_CID_LEN: usize = 128;

/// Largest header accepted when scanning.
pub const MAX_HEADER_LEN: u64 = 1024 * 1024;

const SCAN_CHUNK_SIZE: usize = 64 * 1024;

/// Content identifier of a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockCid(Cid);

impl BlockCid {
    /// Computes the raw-codec identifier of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self::from_digest(RAW_CODEC, &Sha256::digest(data))
    }

    fn from_digest(codec: u64, digest: &[u8]) -> Self {
        let hash = Multihash::<64>::wrap(SHA2_256, digest)
            .expect("sha2-256 digest should fit a multihash");
        Self(Cid::new_v1(codec, hash))
    }

    pub fn cid(&self) -> &Cid {
        &self.0
    }

    /// Binary CID as written into sections.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    /// Parses the CID at the start of `bytes`, returning it and its encoded length.
    ///
    /// # Errors
    ///
    /// - `CarError::InvalidCid` - If `bytes` does not start with a CID
    pub fn read_prefix(bytes: &[u8]) -> Result<(Self, usize), CarError> {
        let mut rest = bytes;
        let cid = Cid::read_bytes(&mut rest).map_err(|e| CarError::InvalidCid {
            value: hex::encode(bytes),
            reason: e.to_string(),
        })?;
        Ok((Self(cid), bytes.len() - rest.len()))
    }

    /// Checks that `digest` is the sha2-256 digest this CID commits to.
    ///
    /// # Errors
    ///
    /// - `CarError::UnsupportedHash` - If the CID uses another hash function
    /// - `CarError::DigestMismatch` - If the digests differ
    pub fn verify_digest(&self, digest: &[u8]) -> Result<(), CarError> {
        let hash = self.0.hash();
        if hash.code() != SHA2_256 {
            return Err(CarError::UnsupportedHash { code: hash.code() });
        }
        if hash.digest() != digest {
            return Err(CarError::DigestMismatch {
                expected: *self,
                actual: Self::from_digest(self.0.codec(), digest),
            });
        }
        Ok(())
    }
}

impl From<Cid> for BlockCid {
    fn from(cid: Cid) -> Self {
        Self(cid)
    }
}

impl fmt::Display for BlockCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for BlockCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockCid({self})")
    }
}

impl FromStr for BlockCid {
    type Err = CarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::try_from(s).map(Self).map_err(|e| CarError::InvalidCid {
            value: s.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Serialize for BlockCid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockCid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Archive header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarHeader {
    pub version: u64,
    pub roots: Vec<BlockCid>,
}

impl CarHeader {
    pub fn new(roots: Vec<BlockCid>) -> Self {
        Self {
            version: CAR_VERSION,
            roots,
        }
    }

    /// Appends the length-prefixed header to `out`.
    ///
    /// # Errors
    ///
    /// - `CarError::InvalidHeader` - If the header cannot be serialized
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CarError> {
        let json = serde_json::to_vec(self)?;
        encode_varint(json.len() as u64, out);
        out.extend_from_slice(&json);
        Ok(())
    }

    fn from_json(json: &[u8]) -> Result<Self, CarError> {
        let header: CarHeader = serde_json::from_slice(json)?;
        if header.version != CAR_VERSION {
            return Err(CarError::UnsupportedVersion {
                version: header.version,
            });
        }
        Ok(header)
    }
}

/// Location of one block inside an encoded archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRef {
    pub cid: BlockCid,
    /// Offset of the block bytes, past the length prefix and the cid
    pub offset: u64,
    pub length: u64,
}

/// Result of scanning a whole archive.
#[derive(Debug)]
pub struct ArchiveScan {
    pub header: CarHeader,
    pub sections: Vec<SectionRef>,
    /// Archive length in bytes
    pub end: u64,
}

/// Appends `varint(len) || cid || data` to `out`.
pub fn encode_section(cid: &BlockCid, data: &[u8], out: &mut Vec<u8>) {
    let cid_bytes = cid.to_bytes();
    encode_varint((cid_bytes.len() + data.len()) as u64, out);
    out.extend_from_slice(&cid_bytes);
    out.extend_from_slice(data);
}

/// Streams an archive from `reader`, validating every block against its CID.
///
/// Offsets in the returned sections are relative to the first byte read.
/// Block bytes are hashed in fixed-size chunks and never held whole.
///
/// # Errors
///
/// - `CarError::Truncated` - If the stream ends inside the header or a section
/// - `CarError::VarintOverflow` - If a length prefix is malformed
/// - `CarError::HeaderTooLarge` - If the header exceeds `MAX_HEADER_LEN`
/// - `CarError::InvalidHeader` / `CarError::UnsupportedVersion` - If the header is unusable
/// - `CarError::InvalidCid` - If a section does not start with a CID
/// - `CarError::UnsupportedHash` / `CarError::DigestMismatch` - If a block fails validation
/// - `CarError::Io` - If reading failed
pub async fn scan_archive<R: AsyncRead + Unpin>(reader: R) -> Result<ArchiveScan, CarError> {
    let mut reader = BufReader::with_capacity(SCAN_CHUNK_SIZE, reader);

    let (header_len, prefix) = read_varint(&mut reader, 0)
        .await?
        .ok_or(CarError::Truncated { offset: 0 })?;
    if header_len > MAX_HEADER_LEN {
        return Err(CarError::HeaderTooLarge { length: header_len });
    }
    let mut pos = prefix as u64;
    let mut json = vec![0u8; header_len as usize];
    read_exact_at(&mut reader, &mut json, pos).await?;
    let header = CarHeader::from_json(&json)?;
    pos += header_len;

    let mut sections = Vec::new();
    let mut chunk = vec![0u8; SCAN_CHUNK_SIZE];
    while let Some((len, prefix)) = read_varint(&mut reader, pos).await? {
        pos += prefix as u64;
        sections.push(read_section(&mut reader, pos, len, &mut chunk).await?);
        pos = pos.checked_add(len).ok_or(CarError::VarintOverflow)?;
    }

    Ok(ArchiveScan {
        header,
        sections,
        end: pos,
    })
}

async fn read_section<R: AsyncRead + Unpin>(
    reader: &mut R,
    start: u64,
    len: u64,
    chunk: &mut [u8],
) -> Result<SectionRef, CarError> {
    let head_len = len.min(MAX_CID_LEN as u64) as usize;
    let mut head = [0u8; MAX_CID_LEN];
    read_exact_at(reader, &mut head[..head_len], start).await?;
    let (cid, cid_len) = BlockCid::read_prefix(&head[..head_len])?;

    let mut hasher = Sha256::new();
    hasher.update(&head[cid_len..head_len]);
    let mut remaining = len - head_len as u64;
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        read_exact_at(reader, &mut chunk[..want], start + (len - remaining)).await?;
        hasher.update(&chunk[..want]);
        remaining -= want as u64;
    }
    cid.verify_digest(&hasher.finalize())?;

    Ok(SectionRef {
        cid,
        offset: start + cid_len as u64,
        length: len - cid_len as u64,
    })
}

/// Reads one varint, returning `None` on a clean end of stream.
async fn read_varint<R: AsyncRead + Unpin>(
    reader: &mut R,
    pos: u64,
) -> Result<Option<(u64, usize)>, CarError> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    for i in 0..MAX_VARINT_LEN {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof && i == 0 => return Ok(None),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(CarError::Truncated {
                    offset: pos + i as u64,
                });
            }
            Err(e) => return Err(e.into()),
        };
        buf[i] = byte;
        if byte & 0x80 == 0 {
            return decode_varint(&buf[..=i]).map(Some);
        }
    }
    Err(CarError::VarintOverflow)
}

async fn read_exact_at<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    pos: u64,
) -> Result<(), CarError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(CarError::Truncated { offset: pos }),
        Err(e) => Err(e.into()),
    }
}

/// Appends the LEB128 encoding of `value` to `out`.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decodes a LEB128 varint from the start of `buf`, returning the value and
/// the number of bytes consumed.
///
/// # Errors
///
/// - `CarError::Truncated` - If `buf` ends before the final byte
/// - `CarError::VarintOverflow` - If the encoding exceeds `MAX_VARINT_LEN` bytes or 64 bits
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize), CarError> {
    let mut value = 0u64;
    for (i, byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        let bits = u64::from(byte & 0x7f);
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(CarError::VarintOverflow);
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    if buf.len() >= MAX_VARINT_LEN {
        Err(CarError::VarintOverflow)
    } else {
        Err(CarError::Truncated {
            offset: buf.len() as u64,
        })
    }
}
