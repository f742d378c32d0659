//! Neural network models of the agent.
mod critic;
mod decoder;
mod encoder;

pub use critic::{Critic, CriticConfig};
pub use decoder::{
    DecoderCapabilities, DecoderConfig, DecoderInput, DecoderOutput, DecoderState, StepDecoder,
};
pub use encoder::{segment_instruction, ConfigContext, EncoderConfig, EncoderOutput, InstructionEncoder, Span};

/// Feature sizes fixed by the data rather than by model hyper-parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FeatureDims {
    /// Size of the directional encoding appended to visual features.
    pub angle_feat_size: usize,
    /// Size of a visual feature, excluding the directional encoding.
    pub visual_size: usize,
    /// Size of object, landmark, and motion text embeddings.
    pub text_dim: usize,
    /// Size of an object-pair relation feature.
    pub relation_dim: usize,
}

impl FeatureDims {
    /// Size of an assembled panoramic or candidate feature row.
    pub const fn feature_size(&self) -> usize {
        self.visual_size + self.angle_feat_size
    }
}
