pub mod backup;
pub mod backup_scheduler;
pub mod participants;
pub mod registration;
pub mod settings_store;
pub mod signal;
