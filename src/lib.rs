pub mod collaborator;
pub mod config;
pub mod events;
pub mod logging;
pub mod response;
pub mod routes;
pub mod services;
pub mod session;
pub mod state;
pub mod storage;
