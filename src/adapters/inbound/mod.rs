mod mgmt_server;

pub use mgmt_server::{mgmt_router, HealthResponse, MgmtServer};
