/// Transformation of source rows into warehouse records.
///
/// Submodules:
/// - `population` — daily population series interpolated from yearly samples.
/// - `joins` — builds Location, LocationMetric and CaseReport streams.

pub mod joins;
pub mod population;
