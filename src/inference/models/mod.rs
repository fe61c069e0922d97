pub mod model;
pub mod qwen3_vl;
