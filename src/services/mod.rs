pub mod codec;
pub mod download_service;
pub mod ledger;
pub mod storage_service;
pub mod upload_service;
pub mod upload_worker;
