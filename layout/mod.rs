// Reference k-fold stacking layout and the static check of its write regions.
pub mod kfold;
pub mod regions;
pub use kfold::{CaseLayout, EstimatorLayout, Fold, FoldPlan, LayoutError, StackLayout};
pub use regions::{RegionError, Wave, check_disjoint};
