//! # Courier Storage
//!
//! 采集文件与队列记录的原子落盘。

pub mod writer;

pub use writer::{
    is_temp_file, remove_stale_temps, write_atomic, write_record_atomic, StagedWrite,
    WriteOutcome,
};
