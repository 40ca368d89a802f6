//! CAR block extraction.
//!
//! A commit's `blocks` field is a CAR v1 slice holding the commit node, the
//! touched MST nodes and the new records. Only the record lookup by CID is
//! needed here, so the blocks are read into a flat map; the MST is never
//! walked.

use crate::error::{Error, Result};
use iroh_car::CarReader;
use std::collections::HashMap;

/// Blocks of one commit, keyed by the CID's string form.
#[derive(Debug, Default)]
pub struct BlockMap {
    blocks: HashMap<String, Vec<u8>>,
}

impl BlockMap {
    /// Decode a CAR slice into a block map.
    ///
    /// The reader is driven with a local executor: reading from an in-memory
    /// slice never yields, so no runtime is involved.
    pub fn decode(car: &[u8]) -> Result<Self> {
        futures::executor::block_on(Self::decode_async(car))
    }

    async fn decode_async(car: &[u8]) -> Result<Self> {
        let mut reader = CarReader::new(car)
            .await
            .map_err(|e| Error::Car(e.to_string()))?;

        let mut blocks = HashMap::new();
        while let Some((cid, data)) = reader
            .next_block()
            .await
            .map_err(|e| Error::Car(e.to_string()))?
        {
            blocks.insert(cid.to_string(), data);
        }

        Ok(Self { blocks })
    }

    /// Look up a block by CID string.
    pub fn get(&self, cid: &str) -> Option<&[u8]> {
        self.blocks.get(cid).map(Vec::as_slice)
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the map holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
