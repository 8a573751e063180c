// Key-addressed persistence shared by every worker of a layer call.
pub mod artifact;
pub mod store;
pub mod wait;
pub use artifact::{
    EstimatorArtifact, FittedStep, TransformerArtifact, decode_artifact, encode_artifact,
    estimator_key, load_artifact, save_artifact, score_key, transformer_key,
};
pub use store::{CacheError, CacheStore, DiskStore, MemoryStore};
pub use wait::{WaitError, WaitPolicy, await_artifact};
