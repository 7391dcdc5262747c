pub mod config;
pub mod connectivity;
pub mod domain;
pub mod error;
pub mod extract;
pub mod graph;
pub mod labels;
pub mod merge;
pub mod migrate;
pub mod nifti;
pub mod output;
pub mod pipeline;
pub mod sanitize;
pub mod store;
pub mod table;
pub mod task;
pub mod window;
