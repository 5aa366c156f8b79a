pub mod agent;
pub mod budget;
pub mod checkpoint;
pub mod collab;
pub mod config;
pub mod errors;
pub mod gates;
pub mod logging;
pub mod router;
pub mod scheduler;
pub mod settings;
pub mod story;
pub mod ui;
pub mod usage;
pub mod util;
