pub mod handshake;
pub mod relay;
pub mod rpc;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;

pub(crate) use session::run_session;
