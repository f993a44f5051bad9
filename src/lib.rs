pub mod boundary;
pub mod codes;
pub mod config;
pub mod crs;
pub mod error;
pub mod fetch;
pub mod merge;
pub mod output;
pub mod pipeline;
pub mod score;
pub mod spatial;
pub mod stops;
pub mod tables;
