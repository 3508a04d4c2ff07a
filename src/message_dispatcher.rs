use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// The application boundary on the receiving side: fully reassembled messages are
///  handed in here, in the order their reassembly completed (which is not
///  necessarily the order independent messages were sent in).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, sender: SocketAddr, message: Vec<u8>);
}
