//! Request rewriting: header policy and the body transform pipeline.

pub mod headers;
pub mod json_path;
pub mod transform;

pub use headers::{DropRule, HeaderPolicy, HeaderRules};
pub use transform::{RuleKind, TransformPipeline, TransformRule};
