pub mod error;
pub mod types;

pub mod mutation;
pub mod reactive;
pub mod remote;
pub mod repository;
pub mod schema;
pub mod storage;
pub mod sync;
