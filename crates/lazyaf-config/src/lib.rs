//! System settings and pipeline definition parsing.
//!
//! Pipeline definitions live either in the platform database or in the
//! repository at `.lazyaf/pipelines/*.yaml`; the repo wins on name clash.

pub mod error;
pub mod pipeline;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{PIPELINE_DIR, PipelineDoc, parse_pipeline_yaml};
pub use settings::Settings;
