pub mod apk;
pub mod appliance;
pub mod broker;
pub mod cli;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod executor;
pub mod orchestrator;
pub mod policy;
pub mod report;
pub mod storage;
pub mod util;
pub mod verdict;
