pub mod ledger_service;
pub mod memory_store;
pub mod restore_service;
pub mod storage_service;
pub mod store;
