pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod mqtt_service;
pub mod service_utils;
pub mod session_manager;
pub mod topic_tree;
