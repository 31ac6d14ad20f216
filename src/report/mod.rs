//! Report rendering.

pub mod generator;

pub use generator::{
    generate_batch_summary, generate_json_report, generate_markdown_report, SystemReport,
};
