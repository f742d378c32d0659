//! Instruction batches sorted by decreasing length.
//!
//! The recurrent encoder consumes packed sequences, which must be ordered from longest to
//! shortest. The agent therefore works in sorted order and keeps the permutation to map
//! results back to simulator slots.
use crate::agent::RolloutError;
use crate::envs::Observation;
use tch::{Device, Tensor};

/// Token batch in sorted order.
#[derive(Debug)]
pub struct InstructionBatch {
    /// Token ids truncated to the longest instruction. `[batch, max_len]`, `i64`.
    pub tokens: Tensor,
    /// `true` at padding positions. `[batch, max_len]`, bool.
    pub mask: Tensor,
    /// True instruction lengths, non-increasing.
    pub lengths: Vec<usize>,
    /// `perm[i]` is the simulator slot of sorted position `i`.
    pub perm: Vec<usize>,
}

/// Number of tokens before the first padding token.
pub fn instruction_length(encoding: &[i64], padding_idx: i64) -> usize {
    encoding
        .iter()
        .position(|&t| t == padding_idx)
        .unwrap_or(encoding.len())
}

/// Sort observations by decreasing instruction length and build the token batch.
///
/// The sort is stable so equal-length instructions keep slot order.
pub fn sort_batch(
    obs: &[Observation],
    padding_idx: i64,
    device: Device,
) -> Result<InstructionBatch, RolloutError> {
    let lengths: Vec<usize> = obs
        .iter()
        .map(|ob| instruction_length(&ob.instr_encoding, padding_idx))
        .collect();
    if let Some(i) = lengths.iter().position(|&len| len == 0) {
        return Err(RolloutError::EmptyInstruction(obs[i].instr_id.clone()));
    }

    let mut perm: Vec<usize> = (0..obs.len()).collect();
    perm.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
    let sorted_lengths: Vec<usize> = perm.iter().map(|&i| lengths[i]).collect();
    let max_len = sorted_lengths.first().copied().unwrap_or(0);

    let mut tokens = Vec::with_capacity(obs.len() * max_len);
    let mut mask = Vec::with_capacity(obs.len() * max_len);
    for (&i, &len) in perm.iter().zip(&sorted_lengths) {
        let encoding = &obs[i].instr_encoding;
        tokens.extend((0..max_len).map(|t| encoding.get(t).copied().unwrap_or(padding_idx)));
        mask.extend((0..max_len).map(|t| t >= len));
    }
    let shape = [obs.len() as i64, max_len as i64];
    Ok(InstructionBatch {
        tokens: Tensor::of_slice(&tokens).reshape(&shape).to_device(device),
        mask: Tensor::of_slice(&mask).reshape(&shape).to_device(device),
        lengths: sorted_lengths,
        perm,
    })
}

/// Reorder `items` so that `output[i] = items[perm[i]]`.
pub fn permute<T: Clone>(items: &[T], perm: &[usize]) -> Vec<T> {
    perm.iter().map(|&i| items[i].clone()).collect()
}

/// The permutation that undoes `perm`.
pub fn inverse_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envs::{Simulator, ToyConfig, ToyWorld};
    use rstest::rstest;

    fn with_tokens(tokens: &[i64]) -> Observation {
        let mut ob = ToyWorld::new(ToyConfig::default()).observations().remove(0);
        ob.instr_encoding = tokens.to_vec();
        ob
    }

    #[rstest]
    #[case(&[5, 6, 0, 0], 2)]
    #[case(&[5, 6, 7], 3)]
    #[case(&[0, 6], 0)]
    fn length_stops_at_padding(#[case] tokens: &[i64], #[case] expected: usize) {
        assert_eq!(instruction_length(tokens, 0), expected);
    }

    #[test]
    fn sorted_descending_and_truncated() {
        let obs = vec![
            with_tokens(&[3, 0, 0, 0, 0]),
            with_tokens(&[3, 4, 5, 0, 0]),
            with_tokens(&[3, 4, 0, 0, 0]),
        ];
        let batch = sort_batch(&obs, 0, Device::Cpu).unwrap();
        assert_eq!(batch.perm, vec![1, 2, 0]);
        assert_eq!(batch.lengths, vec![3, 2, 1]);
        assert_eq!(batch.tokens.size(), vec![3, 3]);
        assert_eq!(
            Vec::<i64>::from(&batch.tokens.reshape(&[-1])),
            vec![3, 4, 5, 3, 4, 0, 3, 0, 0]
        );
        assert_eq!(
            Vec::<bool>::from(&batch.mask.reshape(&[-1])),
            vec![false, false, false, false, false, true, false, true, true]
        );
    }

    #[test]
    fn empty_instruction_is_rejected() {
        let obs = vec![with_tokens(&[3, 0]), with_tokens(&[0, 0])];
        assert!(matches!(
            sort_batch(&obs, 0, Device::Cpu),
            Err(RolloutError::EmptyInstruction(_))
        ));
    }

    #[test]
    fn inverse_undoes_permutation() {
        let perm = vec![2, 0, 3, 1];
        let items = vec!['a', 'b', 'c', 'd'];
        let sorted = permute(&items, &perm);
        assert_eq!(sorted, vec!['c', 'a', 'd', 'b']);
        assert_eq!(permute(&sorted, &inverse_permutation(&perm)), items);
    }
}
