//! Batched beam search for encoder-decoder models.
//!
//! The search drives any model implementing [`Seq2SeqModel`]: the source
//! batch is encoded once, then each step decodes the partial sequences of
//! every live beam in a single call. Instances that reach the end marker are
//! removed from the physical batch so later steps only pay for the ones that
//! are still decoding.
//!
//! ```ignore
//! use candle_beam::{BeamSearchConfig, BeamSearchDecoder, Checkpoint};
//!
//! let checkpoint = Checkpoint::from_dir("checkpoints/en-de")?;
//! let model: MyTransformer = checkpoint.load(DType::F32, &device)?;
//! let config = BeamSearchConfig::new(5, 2)?;
//! let mut decoder = BeamSearchDecoder::new(model, config, &device)?;
//! let hyps = decoder.decode_sequences(&[vec![14, 27, 9], vec![31, 5]])?;
//! ```
pub mod batch;
pub mod beam;
pub mod config;
pub mod decode;
pub mod error;
pub mod hypothesis;
pub mod loader;
pub mod model;
pub mod source;

pub use batch::{compact_rows, replicate_rows, ActiveInstances, SourceContext};
pub use beam::Beam;
pub use config::BeamSearchConfig;
pub use decode::BeamSearchDecoder;
pub use error::{Error, ModelStage, Result};
pub use hypothesis::{extract_hypotheses, split_hypotheses, Hypothesis};
pub use loader::{load_model, Checkpoint, FromCheckpoint, ModelSettings};
pub use model::Seq2SeqModel;
pub use source::SourceBatch;
