//! Stage executors: the only per-stage code.
//!
//! | Stage | Executor | Units |
//! |-------|----------|-------|
//! | crawl | `CrawlExecutor` | one per symbol, partial success allowed |
//! | stage_load | `StageLoadExecutor` | one, all five files or nothing |
//! | transform / warehouse_load / aggregate | `ProcedureStage` | one per procedure, stops at first failure |

pub mod crawl;
pub mod procedures;
pub mod stage_load;

pub use crawl::CrawlExecutor;
pub use procedures::{ProcedureStage, ProcedureStep, load_symbol_filter};
pub use stage_load::StageLoadExecutor;
