pub mod bootstrap;
pub mod health;
pub mod transport;

pub use bootstrap::{bootstrap, bootstrap_with_config, Application, BootstrapError};
pub use transport::HttpTransport;
