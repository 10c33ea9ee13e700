pub mod envfile;
pub mod logging;
pub mod settings;
