//! Neural network modules
mod attention;
mod linear;
mod lstm;
mod mlp;

pub use attention::{masked_softmax, SoftDotAttention};
pub use linear::{Linear, LinearConfig};
pub use lstm::{BiLstm, BiLstmOutput, LstmCell, RnnWeights};
pub use mlp::{Mlp, MlpConfig};
