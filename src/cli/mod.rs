//! Command-line front end
//!
//! ```bash
//! s3link stat s3://bucket/key
//! s3link cat bucket/key --offset 1024 --length 4096
//! s3link put ./local.bin s3://bucket/key --part-size 16777216
//! s3link rm bucket/key
//! ```

pub mod args;
pub mod commands;
