pub mod participant;
pub mod settings;
