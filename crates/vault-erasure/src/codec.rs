//! `CreateParity` / `RepairWithParity` (spec §4.4), built directly on
//! the `reed-solomon-simd` Reed-Solomon MDS backend.

use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("encoding failed: {0}")]
    EncodingFailed(String),
    #[error("decoding failed: {0}")]
    DecodingFailed(String),
    #[error("not enough parity to repair: have {available}, need {required}")]
    NotEnoughParity { available: usize, required: usize },
}

/// One member of a repair call: either still-present bytes, or `None`
/// if the member is broken. `real_length` is the number of meaningful
/// bytes once the shard-level zero padding is stripped back off after
/// reconstruction.
#[derive(Clone, Debug)]
pub struct ShardSlot {
    pub data: Option<Vec<u8>>,
    pub real_length: usize,
}

impl ShardSlot {
    #[must_use]
    pub const fn present(data: Vec<u8>, real_length: usize) -> Self {
        Self {
            data: Some(data),
            real_length,
        }
    }

    #[must_use]
    pub const fn broken(real_length: usize) -> Self {
        Self {
            data: None,
            real_length,
        }
    }

    #[must_use]
    pub const fn is_broken(&self) -> bool {
        self.data.is_none()
    }
}

/// Round a length up to the nearest even, non-zero value — the minimum
/// `reed-solomon-simd` accepts as a shard size.
fn shard_alignment(len: usize) -> usize {
    let len = len.max(2);
    len + (len % 2)
}

/// A fixed (N data, M parity) Reed-Solomon codec. N and M never change
/// for the life of a vault.
pub struct ParityCodec {
    data_shards: usize,
    parity_shards: usize,
}

impl ParityCodec {
    pub fn new(data_shards: u32, parity_shards: u32) -> Result<Self, ErasureError> {
        if data_shards == 0 {
            return Err(ErasureError::InvalidConfig("data_shards must be > 0".into()));
        }
        if parity_shards == 0 {
            return Err(ErasureError::InvalidConfig(
                "parity_shards must be > 0".into(),
            ));
        }
        if data_shards as usize + parity_shards as usize > 255 {
            return Err(ErasureError::InvalidConfig(
                "total shards must be <= 255".into(),
            ));
        }
        Ok(Self {
            data_shards: data_shards as usize,
            parity_shards: parity_shards as usize,
        })
    }

    #[must_use]
    pub const fn data_shards(&self) -> usize {
        self.data_shards
    }

    #[must_use]
    pub const fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    /// `CreateParity(data, M) -> M byte strings`. All inputs are
    /// logically padded to the max input length; every returned parity
    /// shard has that same padded length.
    pub fn create_parity(&self, data: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, ErasureError> {
        if data.len() != self.data_shards {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} data shards, got {}",
                self.data_shards,
                data.len()
            )));
        }

        let max_len = data.iter().map(Vec::len).max().unwrap_or(0);
        let shard_size = shard_alignment(max_len);

        let padded: Vec<Vec<u8>> = data
            .iter()
            .map(|d| {
                let mut v = d.clone();
                v.resize(shard_size, 0);
                v
            })
            .collect();

        let mut encoder = ReedSolomonEncoder::new(self.data_shards, self.parity_shards, shard_size)
            .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
        for shard in &padded {
            encoder
                .add_original_shard(shard)
                .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
        }
        let result = encoder
            .encode()
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;

        Ok(result.recovery_iter().map(<[u8]>::to_vec).collect())
    }

    /// `RepairWithParity(dataInfo, parityInfo)`: reconstructs missing
    /// data and/or parity members in place. Fails with
    /// [`ErasureError::NotEnoughParity`] when more than M members across
    /// the N+M set are broken.
    pub fn repair_with_parity(
        &self,
        data_info: &mut [ShardSlot],
        parity_info: &mut [ShardSlot],
    ) -> Result<(), ErasureError> {
        let k = self.data_shards;
        let m = self.parity_shards;
        if data_info.len() != k {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {k} data members, got {}",
                data_info.len()
            )));
        }
        if parity_info.len() != m {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {m} parity members, got {}",
                parity_info.len()
            )));
        }

        // Present data members are generally *shorter* than the shard
        // width the encoder actually used — each data chunk's own
        // compressed length, before the padding `create_parity` applied
        // to the longest member. Present parity members, in contrast,
        // are always stored at exactly that padded width. Taking the
        // max across every present member (not just the first one
        // found) recovers the true encode-time shard size regardless of
        // which members happen to be present.
        let shard_size = data_info
            .iter()
            .chain(parity_info.iter())
            .filter_map(|s| s.data.as_ref().map(Vec::len))
            .max()
            .ok_or_else(|| ErasureError::NotEnoughParity {
                available: 0,
                required: k,
            })?;

        let broken = data_info.iter().filter(|s| s.is_broken()).count()
            + parity_info.iter().filter(|s| s.is_broken()).count();
        let available = k + m - broken;
        if available < k {
            return Err(ErasureError::NotEnoughParity {
                available,
                required: k,
            });
        }

        let missing_data: Vec<usize> = data_info
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.is_broken().then_some(i))
            .collect();

        if !missing_data.is_empty() {
            let mut decoder = ReedSolomonDecoder::new(k, m, shard_size)
                .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;
            for (i, slot) in data_info.iter().enumerate() {
                if let Some(d) = &slot.data {
                    // Data members are stored at their own compressed
                    // length, not the padded shard width — pad up to
                    // `shard_size` here the same way `create_parity`
                    // did at encode time, so every shard handed to the
                    // decoder is uniformly sized.
                    let mut padded = d.clone();
                    padded.resize(shard_size, 0);
                    decoder
                        .add_original_shard(i, &padded)
                        .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
                }
            }
            for (i, slot) in parity_info.iter().enumerate() {
                if let Some(d) = &slot.data {
                    decoder
                        .add_recovery_shard(i, d)
                        .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
                }
            }
            let result = decoder
                .decode()
                .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;

            for &i in &missing_data {
                let restored = result.restored_original(i).ok_or_else(|| {
                    ErasureError::DecodingFailed(format!("failed to restore data shard {i}"))
                })?;
                let mut bytes = restored.to_vec();
                bytes.truncate(data_info[i].real_length);
                data_info[i].data = Some(bytes);
            }
        }

        let missing_parity: Vec<usize> = parity_info
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.is_broken().then_some(i))
            .collect();

        if !missing_parity.is_empty() {
            let full_data: Vec<Vec<u8>> = data_info
                .iter()
                .map(|s| {
                    let mut v = s
                        .data
                        .clone()
                        .expect("all data members are present or repaired above");
                    v.resize(shard_size, 0);
                    v
                })
                .collect();
            let recomputed = self.create_parity(&full_data)?;
            for &i in &missing_parity {
                let mut bytes = recomputed[i].clone();
                bytes.truncate(parity_info[i].real_length);
                parity_info[i].data = Some(bytes);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k).map(|i| vec![i as u8; len]).collect()
    }

    #[test]
    fn create_parity_produces_m_shards_of_padded_length() {
        let codec = ParityCodec::new(4, 2).unwrap();
        let data = sample_data(4, 1024);
        let parity = codec.create_parity(&data).unwrap();
        assert_eq!(parity.len(), 2);
        assert!(parity.iter().all(|p| p.len() == 1024));
    }

    #[test]
    fn create_parity_pads_to_max_input_length() {
        let codec = ParityCodec::new(3, 2).unwrap();
        let data = vec![vec![1u8; 100], vec![2u8; 400], vec![3u8; 250]];
        let parity = codec.create_parity(&data).unwrap();
        assert!(parity.iter().all(|p| p.len() == 400));
    }

    #[test]
    fn repairs_single_missing_data_shard() {
        let codec = ParityCodec::new(4, 2).unwrap();
        let data = sample_data(4, 1024);
        let parity = codec.create_parity(&data).unwrap();

        let mut data_info: Vec<ShardSlot> = data
            .iter()
            .map(|d| ShardSlot::present(d.clone(), d.len()))
            .collect();
        data_info[1] = ShardSlot::broken(1024);
        let mut parity_info: Vec<ShardSlot> = parity
            .iter()
            .map(|p| ShardSlot::present(p.clone(), p.len()))
            .collect();

        codec
            .repair_with_parity(&mut data_info, &mut parity_info)
            .unwrap();
        assert_eq!(data_info[1].data.as_ref().unwrap(), &data[1]);
    }

    #[test]
    fn repairs_missing_parity_shard_by_re_encoding() {
        let codec = ParityCodec::new(4, 2).unwrap();
        let data = sample_data(4, 1024);
        let parity = codec.create_parity(&data).unwrap();

        let data_info: Vec<ShardSlot> = data
            .iter()
            .map(|d| ShardSlot::present(d.clone(), d.len()))
            .collect();
        let mut parity_info: Vec<ShardSlot> = parity
            .iter()
            .map(|p| ShardSlot::present(p.clone(), p.len()))
            .collect();
        parity_info[0] = ShardSlot::broken(parity[0].len());

        let mut data_info = data_info;
        codec
            .repair_with_parity(&mut data_info, &mut parity_info)
            .unwrap();
        assert_eq!(parity_info[0].data.as_ref().unwrap(), &parity[0]);
    }

    #[test]
    fn repairs_missing_data_shard_when_present_members_have_unequal_lengths() {
        // Real data members are each some chunk's own compressed length
        // (varying chunk to chunk), not the padded shard width used
        // internally; the broken member (index 0) is also the longest,
        // so `shard_size` must come from the always-fully-padded parity
        // member rather than from whichever data member happens to be
        // present first.
        let codec = ParityCodec::new(3, 1).unwrap();
        let data = vec![vec![9u8; 16], vec![2u8; 9], vec![7u8; 5]];
        let parity = codec.create_parity(&data).unwrap();
        assert_eq!(parity[0].len(), 16);

        let mut data_info: Vec<ShardSlot> = data
            .iter()
            .map(|d| ShardSlot::present(d.clone(), d.len()))
            .collect();
        data_info[0] = ShardSlot::broken(16);
        let mut parity_info: Vec<ShardSlot> = parity
            .iter()
            .map(|p| ShardSlot::present(p.clone(), p.len()))
            .collect();

        codec
            .repair_with_parity(&mut data_info, &mut parity_info)
            .unwrap();
        assert_eq!(data_info[0].data.as_ref().unwrap(), &data[0]);
    }

    #[test]
    fn repairs_missing_parity_shard_when_data_members_have_unequal_lengths() {
        // The present member encountered first (index 0) is shorter
        // than the true shard width; deriving `shard_size` from it
        // would truncate the longer member (index 1) before the
        // re-encode, corrupting the recomputed parity shard.
        let codec = ParityCodec::new(3, 1).unwrap();
        let data = vec![vec![2u8; 9], vec![9u8; 16], vec![7u8; 5]];
        let parity = codec.create_parity(&data).unwrap();

        let data_info: Vec<ShardSlot> = data
            .iter()
            .map(|d| ShardSlot::present(d.clone(), d.len()))
            .collect();
        let mut parity_info: Vec<ShardSlot> = parity
            .iter()
            .map(|p| ShardSlot::present(p.clone(), p.len()))
            .collect();
        parity_info[0] = ShardSlot::broken(parity[0].len());

        let mut data_info = data_info;
        codec
            .repair_with_parity(&mut data_info, &mut parity_info)
            .unwrap();
        assert_eq!(parity_info[0].data.as_ref().unwrap(), &parity[0]);
    }

    #[test]
    fn fails_when_more_than_m_members_are_broken() {
        let codec = ParityCodec::new(4, 2).unwrap();
        let data = sample_data(4, 1024);
        let parity = codec.create_parity(&data).unwrap();

        let mut data_info: Vec<ShardSlot> = data
            .iter()
            .map(|d| ShardSlot::present(d.clone(), d.len()))
            .collect();
        data_info[0] = ShardSlot::broken(1024);
        data_info[1] = ShardSlot::broken(1024);
        let mut parity_info: Vec<ShardSlot> = parity
            .iter()
            .map(|p| ShardSlot::present(p.clone(), p.len()))
            .collect();
        parity_info[0] = ShardSlot::broken(parity[0].len());

        let err = codec
            .repair_with_parity(&mut data_info, &mut parity_info)
            .unwrap_err();
        assert!(matches!(err, ErasureError::NotEnoughParity { .. }));
    }

    #[test]
    fn rejects_wrong_member_counts() {
        let codec = ParityCodec::new(4, 2).unwrap();
        let mut data_info: Vec<ShardSlot> = (0..3).map(|_| ShardSlot::broken(0)).collect();
        let mut parity_info: Vec<ShardSlot> = (0..2).map(|_| ShardSlot::broken(0)).collect();
        assert!(codec
            .repair_with_parity(&mut data_info, &mut parity_info)
            .is_err());
    }
}
