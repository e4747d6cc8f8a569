pub mod context;
pub mod settings;
pub mod status;
pub mod sync;
