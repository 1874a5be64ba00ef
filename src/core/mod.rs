pub mod export;
pub mod job;
pub mod runner;
pub mod schedule;
pub mod script;
pub mod storage;
