pub mod ctld_client;
pub mod port_lookup;
pub mod server;

pub use server::CranedServer;
