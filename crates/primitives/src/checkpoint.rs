//! Side-chain checkpoints embedded in base-chain transactions.
//!
//! A checkpoint is split into fragments, each carried by one OP_RETURN output whose single data
//! push has the following layout:
//!
//! ```text
//! tag | version (1) | checkpoint id (8, big-endian) | index (1) | total (1) | payload (>= 1)
//! ```
//!
//! Recognition is a pure function over the output script: outputs without the tag are ignored,
//! tagged outputs that do not parse are reported as malformed.

use std::{collections::BTreeMap, fmt};

use bitcoin::{
    opcodes::all::OP_RETURN,
    script::{Instruction, PushBytesBuf},
    Block, Script, ScriptBuf, Txid,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::BlockRef;

/// The tag used when none is configured.
pub const DEFAULT_CHECKPOINT_TAG: &str = "awck";

/// The only fragment layout version understood.
pub const FRAGMENT_VERSION: u8 = 0;

/// Size of the fragment header that follows the tag.
pub const FRAGMENT_HEADER_LEN: usize = 1 + 8 + 1 + 1;

/// Largest data push relayed by default policy in an OP_RETURN output.
pub const MAX_OP_RETURN_DATA: usize = 80;

/// Identifier of a side-chain checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub u64);

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CheckpointId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Errors produced while parsing a tagged fragment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FragmentParseError {
    /// The push is shorter than the header.
    #[error("fragment data too short: {0} bytes")]
    Truncated(usize),

    /// The version byte is not [`FRAGMENT_VERSION`].
    #[error("unsupported fragment version {0}")]
    UnsupportedVersion(u8),

    /// A checkpoint must consist of at least one fragment.
    #[error("fragment total must be at least 1")]
    ZeroTotal,

    /// The fragment index is not below the total.
    #[error("fragment index {index} out of range for total {total}")]
    IndexOutOfRange {
        /// Index found in the header.
        index: u8,
        /// Total found in the header.
        total: u8,
    },

    /// Nothing follows the header.
    #[error("fragment carries no payload")]
    EmptyPayload,
}

/// Errors produced while building fragment outputs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FragmentEncodeError {
    /// There is nothing to encode.
    #[error("payload is empty")]
    EmptyPayload,

    /// The payload does not fit in 255 fragments.
    #[error("payload needs {0} fragments but at most 255 are allowed")]
    TooManyFragments(usize),

    /// The tag is so long that no payload byte fits in a push.
    #[error("tag of {0} bytes leaves no room for payload")]
    TagTooLong(usize),

    /// The encoded push exceeds [`MAX_OP_RETURN_DATA`].
    #[error("fragment push of {0} bytes exceeds the standard OP_RETURN size")]
    TooLarge(usize),
}

/// The header of a fragment, shared by every fragment of a checkpoint except for `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentHeader {
    /// Checkpoint the fragment belongs to.
    pub id: CheckpointId,

    /// Position of the fragment in the checkpoint payload.
    pub index: u8,

    /// Number of fragments the checkpoint consists of.
    pub total: u8,
}

impl FragmentHeader {
    /// Parses the header and returns the remaining payload.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), FragmentParseError> {
        if data.len() < FRAGMENT_HEADER_LEN {
            return Err(FragmentParseError::Truncated(data.len()));
        }
        let (header, payload) = data.split_at(FRAGMENT_HEADER_LEN);

        let version = header[0];
        if version != FRAGMENT_VERSION {
            return Err(FragmentParseError::UnsupportedVersion(version));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&header[1..9]);
        let index = header[9];
        let total = header[10];

        if total == 0 {
            return Err(FragmentParseError::ZeroTotal);
        }
        if index >= total {
            return Err(FragmentParseError::IndexOutOfRange { index, total });
        }
        if payload.is_empty() {
            return Err(FragmentParseError::EmptyPayload);
        }

        let header = Self {
            id: CheckpointId(u64::from_be_bytes(id)),
            index,
            total,
        };

        Ok((header, payload))
    }

    /// Serializes the header, version byte included.
    pub fn encode(&self) -> [u8; FRAGMENT_HEADER_LEN] {
        let mut buf = [0u8; FRAGMENT_HEADER_LEN];
        buf[0] = FRAGMENT_VERSION;
        buf[1..9].copy_from_slice(&self.id.0.to_be_bytes());
        buf[9] = self.index;
        buf[10] = self.total;
        buf
    }
}

/// Where a fragment was found on the base chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentSource {
    /// The block containing the transaction.
    pub block: BlockRef,

    /// Position of the transaction in the block.
    pub tx_index: usize,

    /// The transaction carrying the fragment.
    pub txid: Txid,

    /// The OP_RETURN output carrying the fragment.
    pub vout: u32,
}

/// One piece of a checkpoint payload observed on the base chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFragment {
    /// Parsed header.
    pub header: FragmentHeader,

    /// Where the fragment was found.
    pub source: FragmentSource,

    /// Payload bytes carried by this fragment.
    pub payload: Vec<u8>,
}

impl CheckpointFragment {
    /// The checkpoint this fragment belongs to.
    pub const fn id(&self) -> CheckpointId {
        self.header.id
    }

    /// The position of this fragment.
    pub const fn index(&self) -> u8 {
        self.header.index
    }

    /// Whether `other` carries the same bytes for the same slot, regardless of where it was seen.
    pub fn same_content(&self, other: &Self) -> bool {
        self.header == other.header && self.payload == other.payload
    }
}

/// A fully assembled checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Identifier of the checkpoint.
    pub id: CheckpointId,

    /// Fragment payloads concatenated in index order.
    pub payload: Vec<u8>,

    /// Blocks the fragments were taken from, in fragment order, without repetition.
    pub sources: Vec<BlockRef>,
}

impl Checkpoint {
    /// Assembles a checkpoint out of `fragments`, keyed by their index.
    ///
    /// Returns `None` unless every index in `0..total` is present.
    pub fn assemble(
        id: CheckpointId,
        total: u8,
        fragments: &BTreeMap<u8, CheckpointFragment>,
    ) -> Option<Self> {
        let mut payload = Vec::new();
        let mut sources: Vec<BlockRef> = Vec::new();

        for index in 0..total {
            let fragment = fragments.get(&index)?;
            payload.extend_from_slice(&fragment.payload);

            if !sources.contains(&fragment.source.block) {
                sources.push(fragment.source.block);
            }
        }

        Some(Self {
            id,
            payload,
            sources,
        })
    }
}

/// Returns the data of the first push of an OP_RETURN script.
pub fn op_return_data(script: &Script) -> Option<&[u8]> {
    let mut instructions = script.instructions();
    if let Some(Ok(Instruction::Op(OP_RETURN))) = instructions.next() {
        // NOOP
    } else {
        return None;
    }

    if let Some(Ok(Instruction::PushBytes(bytes))) = instructions.next() {
        Some(bytes.as_bytes())
    } else {
        None
    }
}

/// Returns the OP_RETURN data following `tag`, if the script carries it.
pub fn magic_tagged_data<'script>(tag: &[u8], script: &'script Script) -> Option<&'script [u8]> {
    op_return_data(script).and_then(|data| data.strip_prefix(tag))
}

/// Classifies an output script.
///
/// Returns `None` for outputs that are not fragments, `Some(Err(_))` for tagged outputs that are
/// malformed and `Some(Ok(_))` with the header and payload otherwise.
pub fn classify_output<'script>(
    tag: &[u8],
    script: &'script Script,
) -> Option<Result<(FragmentHeader, &'script [u8]), FragmentParseError>> {
    magic_tagged_data(tag, script).map(FragmentHeader::parse)
}

/// How many payload bytes fit in a single fragment with `tag`.
pub const fn max_payload_per_fragment(tag: &[u8]) -> usize {
    MAX_OP_RETURN_DATA.saturating_sub(tag.len() + FRAGMENT_HEADER_LEN)
}

/// Builds the OP_RETURN output script carrying one fragment.
pub fn encode_fragment(
    tag: &[u8],
    header: FragmentHeader,
    payload: &[u8],
) -> Result<ScriptBuf, FragmentEncodeError> {
    if payload.is_empty() {
        return Err(FragmentEncodeError::EmptyPayload);
    }

    let mut data = Vec::with_capacity(tag.len() + FRAGMENT_HEADER_LEN + payload.len());
    data.extend_from_slice(tag);
    data.extend_from_slice(&header.encode());
    data.extend_from_slice(payload);

    let len = data.len();
    if len > MAX_OP_RETURN_DATA {
        return Err(FragmentEncodeError::TooLarge(len));
    }

    let push = PushBytesBuf::try_from(data).map_err(|_| FragmentEncodeError::TooLarge(len))?;

    Ok(ScriptBuf::new_op_return(push))
}

/// Splits `payload` into as few fragment outputs as possible, in index order.
pub fn split_payload(
    tag: &[u8],
    id: CheckpointId,
    payload: &[u8],
) -> Result<Vec<ScriptBuf>, FragmentEncodeError> {
    if payload.is_empty() {
        return Err(FragmentEncodeError::EmptyPayload);
    }

    let chunk_size = max_payload_per_fragment(tag);
    if chunk_size == 0 {
        return Err(FragmentEncodeError::TagTooLong(tag.len()));
    }

    let count = payload.len().div_ceil(chunk_size);
    let total = u8::try_from(count).map_err(|_| FragmentEncodeError::TooManyFragments(count))?;

    payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let header = FragmentHeader {
                id,
                index: index as u8,
                total,
            };
            encode_fragment(tag, header, chunk)
        })
        .collect()
}

/// A tagged output that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedFragment {
    /// The transaction carrying the output.
    pub txid: Txid,

    /// Index of the offending output.
    pub vout: u32,

    /// Why the output was rejected.
    pub error: FragmentParseError,
}

/// Everything fragment-related found in one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFragments {
    /// Well-formed fragments in block order.
    pub fragments: Vec<CheckpointFragment>,

    /// Tagged outputs that failed to parse.
    pub malformed: Vec<MalformedFragment>,
}

/// Scans every output of every transaction of `block` for fragments carrying `tag`.
pub fn extract_fragments(tag: &[u8], block_ref: BlockRef, block: &Block) -> ExtractedFragments {
    let mut extracted = ExtractedFragments::default();

    for (tx_index, tx) in block.txdata.iter().enumerate() {
        for (vout, output) in tx.output.iter().enumerate() {
            let Some(classified) = classify_output(tag, &output.script_pubkey) else {
                continue;
            };

            let txid = tx.compute_txid();
            let vout = vout as u32;

            match classified {
                Ok((header, payload)) => extracted.fragments.push(CheckpointFragment {
                    header,
                    source: FragmentSource {
                        block: block_ref,
                        tx_index,
                        txid,
                        vout,
                    },
                    payload: payload.to_vec(),
                }),
                Err(error) => extracted
                    .malformed
                    .push(MalformedFragment { txid, vout, error }),
            }
        }
    }

    extracted
}

#[cfg(test)]
mod tests {
    use anchor_watch_test_utils::bitcoin::{generate_block, generate_tx_with_output};
    use bitcoin::{hashes::Hash, BlockHash};
    use proptest::prelude::*;

    use super::*;

    const TAG: &[u8] = DEFAULT_CHECKPOINT_TAG.as_bytes();

    fn raw_fragment(version: u8, id: u64, index: u8, total: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = TAG.to_vec();
        data.push(version);
        data.extend_from_slice(&id.to_be_bytes());
        data.push(index);
        data.push(total);
        data.extend_from_slice(payload);
        data
    }

    fn op_return(data: Vec<u8>) -> ScriptBuf {
        ScriptBuf::new_op_return(PushBytesBuf::try_from(data).unwrap())
    }

    fn fragment(id: u64, index: u8, total: u8, payload: Vec<u8>) -> CheckpointFragment {
        CheckpointFragment {
            header: FragmentHeader {
                id: CheckpointId(id),
                index,
                total,
            },
            source: FragmentSource {
                block: BlockRef::new(u64::from(index), BlockHash::all_zeros()),
                tx_index: 1,
                txid: Txid::all_zeros(),
                vout: 0,
            },
            payload,
        }
    }

    #[test]
    fn untagged_outputs_are_not_fragments() {
        let other_tag = op_return(b"nope-some-other-protocol".to_vec());
        let p2wsh = ScriptBuf::new_p2wsh(&bitcoin::WScriptHash::all_zeros());

        assert!(classify_output(TAG, &other_tag).is_none());
        assert!(classify_output(TAG, &p2wsh).is_none());
        assert!(classify_output(TAG, &ScriptBuf::new()).is_none());
    }

    #[test]
    fn tagged_outputs_are_parsed() {
        let script = op_return(raw_fragment(0, 42, 1, 3, b"hello"));

        let (header, payload) = classify_output(TAG, &script).unwrap().unwrap();

        assert_eq!(
            header,
            FragmentHeader {
                id: CheckpointId(42),
                index: 1,
                total: 3
            }
        );
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn malformed_tagged_outputs_are_reported() {
        let cases = [
            (raw_fragment(1, 1, 0, 1, b"x"), FragmentParseError::UnsupportedVersion(1)),
            (raw_fragment(0, 1, 0, 0, b"x"), FragmentParseError::ZeroTotal),
            (
                raw_fragment(0, 1, 2, 2, b"x"),
                FragmentParseError::IndexOutOfRange { index: 2, total: 2 },
            ),
            (raw_fragment(0, 1, 0, 1, b""), FragmentParseError::EmptyPayload),
            ([TAG, &[0u8, 1, 2][..]].concat(), FragmentParseError::Truncated(3)),
        ];

        for (data, expected) in cases {
            let script = op_return(data);
            assert_eq!(classify_output(TAG, &script), Some(Err(expected)));
        }
    }

    #[test]
    fn split_respects_standard_op_return_size() {
        let payload = (0..=255u8).cycle().take(200).collect::<Vec<_>>();
        let scripts = split_payload(TAG, CheckpointId(7), &payload).unwrap();

        let per_fragment = max_payload_per_fragment(TAG);
        assert_eq!(scripts.len(), payload.len().div_ceil(per_fragment));
        for script in &scripts {
            assert!(op_return_data(script).unwrap().len() <= MAX_OP_RETURN_DATA);
        }
    }

    #[test]
    fn split_rejects_unencodable_payloads() {
        assert_eq!(
            split_payload(TAG, CheckpointId(1), &[]),
            Err(FragmentEncodeError::EmptyPayload)
        );

        let too_big = vec![0u8; max_payload_per_fragment(TAG) * 255 + 1];
        assert_eq!(
            split_payload(TAG, CheckpointId(1), &too_big),
            Err(FragmentEncodeError::TooManyFragments(256))
        );

        let long_tag = [0u8; MAX_OP_RETURN_DATA];
        assert_eq!(
            split_payload(&long_tag, CheckpointId(1), b"x"),
            Err(FragmentEncodeError::TagTooLong(MAX_OP_RETURN_DATA))
        );
    }

    #[test]
    fn extract_finds_fragments_and_malformed_outputs() {
        let payload = vec![0xab; 150];
        let mut txs = split_payload(TAG, CheckpointId(9), &payload)
            .unwrap()
            .into_iter()
            .map(generate_tx_with_output)
            .collect::<Vec<_>>();
        txs.push(generate_tx_with_output(op_return(raw_fragment(3, 9, 0, 1, b"x"))));

        let block = generate_block(500, BlockHash::all_zeros(), txs);
        let block_ref = BlockRef::of(500, &block);

        let extracted = extract_fragments(TAG, block_ref, &block);

        assert_eq!(extracted.fragments.len(), 3);
        assert_eq!(extracted.malformed.len(), 1);
        assert_eq!(
            extracted.malformed[0].error,
            FragmentParseError::UnsupportedVersion(3)
        );
        for (i, fragment) in extracted.fragments.iter().enumerate() {
            assert_eq!(fragment.index() as usize, i);
            assert_eq!(fragment.source.block, block_ref);
            // the coinbase sits at index 0
            assert_eq!(fragment.source.tx_index, i + 1);
        }

        let by_index = extracted
            .fragments
            .into_iter()
            .map(|f| (f.index(), f))
            .collect::<BTreeMap<_, _>>();
        let checkpoint = Checkpoint::assemble(CheckpointId(9), 3, &by_index).unwrap();
        assert_eq!(checkpoint.payload, payload);
        assert_eq!(checkpoint.sources, vec![block_ref]);
    }

    #[test]
    fn assemble_requires_every_fragment() {
        let mut fragments = BTreeMap::new();
        fragments.insert(0, fragment(1, 0, 3, vec![1]));
        fragments.insert(2, fragment(1, 2, 3, vec![3]));

        assert!(Checkpoint::assemble(CheckpointId(1), 3, &fragments).is_none());

        fragments.insert(1, fragment(1, 1, 3, vec![2]));
        let checkpoint = Checkpoint::assemble(CheckpointId(1), 3, &fragments).unwrap();
        assert_eq!(checkpoint.payload, vec![1, 2, 3]);
        assert_eq!(checkpoint.sources.len(), 3);
    }

    /// Payload chunks together with a random arrival order of their indices.
    fn chunks_and_order() -> impl Strategy<Value = (Vec<Vec<u8>>, Vec<usize>)> {
        prop::collection::vec(prop::collection::vec(any::<u8>(), 1..40), 1..20).prop_flat_map(
            |chunks| {
                let order = (0..chunks.len()).collect::<Vec<_>>();
                (Just(chunks), Just(order).prop_shuffle())
            },
        )
    }

    proptest! {
        #[test]
        fn out_of_order_fragments_assemble_in_index_order(
            (chunks, order) in chunks_and_order(),
        ) {
            let total = chunks.len() as u8;

            let mut fragments = BTreeMap::new();
            for i in order {
                let f = fragment(5, i as u8, total, chunks[i].clone());
                fragments.insert(f.index(), f);
            }

            let checkpoint = Checkpoint::assemble(CheckpointId(5), total, &fragments).unwrap();
            prop_assert_eq!(checkpoint.payload, chunks.concat());
        }
    }
}
