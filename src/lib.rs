pub mod backend;
pub mod config;
pub mod errors;
pub mod gateway;

pub use backend::{
    Authenticator, BackendError, Connection, ConnectionFactory, Credentials, Invoker,
};
pub use config::{Config, Settings};
pub use errors::GatewayError;
pub use gateway::{Gateway, GatewayStats};
