pub mod api_client;
pub mod config;
pub mod control;
pub mod devfee;
pub mod error;
pub mod events;
pub mod hash_service;
pub mod orchestrator;
pub mod poller;
pub mod preimage;
pub mod receipts;
pub mod registry;
pub mod remote;
pub mod solver;
pub mod stability;
pub mod submitter;
pub mod test_utils;
pub mod wallet;
pub mod workers;
