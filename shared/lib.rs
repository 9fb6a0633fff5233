pub mod options;
pub mod settings;
pub mod store;
