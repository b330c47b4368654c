pub mod connection;
pub mod tcp;

pub use connection::{
    Authenticator, BackendError, Connection, ConnectionFactory, Credentials, Invoker,
};
pub use tcp::{TcpConnection, TcpConnectionFactory};
