#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod diagnostics;
pub mod estimation;
pub mod layer;
pub mod learner;
pub mod matrix;
pub mod parallel;
pub mod scores;
pub mod slice;
pub mod stages;
pub mod types;

#[path = "../cache/mod.rs"]
pub mod cache;

#[path = "../layout/mod.rs"]
pub mod layout;

pub use diagnostics::{
    ConsoleDiagnostics, Diagnostics, Origin, RecordingDiagnostics, Verbosity, Warning,
    WarningKind,
};
pub use estimation::{
    EstimationError, FittedCase, FittedEstimator, FittedLayer, LayerEstimator, StageKind,
    Topology,
};
pub use layer::{ConfigError, Layer, LayerConfig};
pub use learner::{Capability, Learner, LearnerError, PredictMethod, ScoreFn, Unsupported};
pub use matrix::{MatrixError, PredictionMatrix};
pub use parallel::{ParallelExecutor, RayonExecutor, SequentialExecutor, Task};
pub use scores::{ScoreEntry, ScoreRecord, ScoreTable};
pub use types::{
    Case, ColumnMap, ColumnSpan, CsrMatrix, Features, FitScope, IndexSpec, Instance,
    Prediction, RowRange, TaskSpec,
};
