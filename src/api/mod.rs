mod mock;
mod server;

pub use mock::MockedEndpoint;
pub use server::{MockProxy, ProxyEnv};
