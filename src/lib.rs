pub mod batch;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod escalation;
pub mod models;
pub mod report;
pub mod scoring;
pub mod service;
pub mod store;
pub mod trend;
