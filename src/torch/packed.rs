//! Packing of padded batches.
//!
//! A packed tensor stores heterogeneous-length sequences interleaved along the first
//! dimension: the first steps of all sequences, then the second steps, and so on.
//! Sequences are packed from longest to shortest, so for example the sequences
//! `[0, 1, 2, 3]`, `[10, 11]`, `[100, 101]` are packed as `[0, 10, 100, 1, 11, 101, 2, 3]`.
use tch::{Device, Kind, Tensor};

/// Packing layout of a batch with non-increasing sequence lengths.
#[derive(Debug)]
pub struct PackedBatch {
    /// Row of the flattened `[batch * seq_len]` padded tensor for each packed row.
    index: Tensor,
    /// Number of sequences active at each step (on the CPU).
    batch_sizes: Tensor,
    batch_size: i64,
}

impl PackedBatch {
    /// # Panics
    /// If `lengths` is increasing anywhere.
    pub fn new(lengths: &[usize], device: Device) -> Self {
        assert!(
            lengths.windows(2).all(|w| w[0] >= w[1]),
            "sequence lengths must be non-increasing"
        );
        let max_len = lengths.first().copied().unwrap_or(0);
        let mut index = Vec::with_capacity(lengths.iter().sum());
        let mut batch_sizes = Vec::with_capacity(max_len);
        for t in 0..max_len {
            let active = lengths.iter().take_while(|&&len| len > t).count();
            batch_sizes.push(active as i64);
            index.extend((0..active).map(|b| (b * max_len + t) as i64));
        }
        Self {
            index: Tensor::of_slice(&index).to_device(device),
            batch_sizes: Tensor::of_slice(&batch_sizes),
            batch_size: lengths.len() as i64,
        }
    }

    pub const fn batch_sizes(&self) -> &Tensor {
        &self.batch_sizes
    }

    fn max_len(&self) -> i64 {
        self.batch_sizes.size()[0]
    }

    /// Pack `[batch, seq_len, features]` into `[total_len, features]`.
    pub fn pack(&self, padded: &Tensor) -> Tensor {
        let size = padded.size();
        // The padded input may be wider than the longest sequence
        let max_len = self.max_len();
        let trimmed = padded.narrow(1, 0, max_len);
        trimmed
            .reshape(&[self.batch_size * max_len, size[2]])
            .index_select(0, &self.index)
    }

    /// Unpack `[total_len, features]` into a zero-padded `[batch, seq_len, features]`.
    pub fn unpack(&self, packed: &Tensor, seq_len: i64) -> Tensor {
        let features = packed.size()[1];
        let max_len = self.max_len();
        let out = Tensor::zeros(
            &[self.batch_size * max_len, features],
            (Kind::Float, packed.device()),
        )
        .index_copy(0, &self.index, packed)
        .reshape(&[self.batch_size, max_len, features]);
        if seq_len > max_len {
            let pad = Tensor::zeros(
                &[self.batch_size, seq_len - max_len, features],
                (Kind::Float, packed.device()),
            );
            Tensor::cat(&[out, pad], 1)
        } else {
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_interleaves_steps() {
        let padded = Tensor::of_slice(&[0.0f32, 1.0, 2.0, 3.0, 10.0, 11.0, -1.0, -1.0, 100.0, 101.0, -1.0, -1.0])
            .reshape(&[3, 4, 1]);
        let packed = PackedBatch::new(&[4, 2, 2], Device::Cpu);
        let data = packed.pack(&padded);
        assert_eq!(
            Vec::<f32>::from(&data.reshape(&[-1])),
            vec![0.0, 10.0, 100.0, 1.0, 11.0, 101.0, 2.0, 3.0]
        );
        assert_eq!(Vec::<i64>::from(packed.batch_sizes()), vec![3, 3, 1, 1]);
    }

    #[test]
    fn unpack_restores_padding_as_zero() {
        let padded = Tensor::of_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).reshape(&[2, 3, 1]);
        let packed = PackedBatch::new(&[2, 1], Device::Cpu);
        let restored = packed.unpack(&packed.pack(&padded), 3);
        assert_eq!(
            Vec::<f32>::from(&restored.reshape(&[-1])),
            vec![1.0, 2.0, 0.0, 4.0, 0.0, 0.0]
        );
    }

    #[test]
    #[should_panic]
    fn increasing_lengths_panic() {
        let _ = PackedBatch::new(&[1, 2], Device::Cpu);
    }
}
