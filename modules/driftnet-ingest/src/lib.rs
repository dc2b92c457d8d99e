pub mod assembly;
pub mod cascade;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use assembly::{Assembler, AssemblyStats, Regime};
pub use cascade::Cascade;
pub use pipeline::{IngestOutcome, Pipeline};
pub use traits::{HistoryStore, MediaFetcher, RecordSink};
