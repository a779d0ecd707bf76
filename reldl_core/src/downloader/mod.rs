pub mod chunk_planner;
pub mod integrity;
pub mod ledger;
pub mod reliable_downloader;
pub mod retry_policy;
pub mod session;
pub mod sink;
pub mod strategy;
