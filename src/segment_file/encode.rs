use std::fmt::Debug;

use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};

use crate::{
    errors::{self, ErrorCodes, Errors},
    segment_file::SegmentFile,
};

// Encoding of per-task fragments. Canonical descriptors are JSON; fragments are private to
// one commit and only need to be compact.
pub trait SegmentFragmentCodec: Debug + Send + Sync {
    fn encode(&self, fragment: &SegmentFile) -> errors::Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> errors::Result<SegmentFile>;
}

#[derive(Debug, Default)]
pub struct FragmentBincodeCodec;

impl FragmentBincodeCodec {
    const CONFIG: Configuration<LittleEndian, Fixint, NoLimit> = bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
        .with_no_limit();
}

impl SegmentFragmentCodec for FragmentBincodeCodec {
    fn encode(&self, fragment: &SegmentFile) -> errors::Result<Vec<u8>> {
        bincode::encode_to_vec(fragment, Self::CONFIG)
            .map_err(|e| Errors::new(ErrorCodes::FragmentEncodeError).with_message(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> errors::Result<SegmentFile> {
        let (decoded, _len): (SegmentFile, usize) = bincode::decode_from_slice(data, Self::CONFIG)
            .map_err(|e| Errors::new(ErrorCodes::FragmentDecodeError).with_message(e.to_string()))?;

        Ok(decoded)
    }
}
