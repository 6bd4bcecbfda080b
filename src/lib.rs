pub mod codec;
pub mod config;
pub mod database;
pub mod object;
pub mod storage;
pub mod value;
