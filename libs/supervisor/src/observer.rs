//! Advisory events about the lifecycle of individual tunnel connections.

pub trait Observer: Send + Sync {
    fn send_connected(&self, conn_index: u8);
    fn send_reconnect(&self, conn_index: u8);
    fn send_disconnect(&self, conn_index: u8);
}

/// Observer that only logs.
#[derive(Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn send_connected(&self, conn_index: u8) {
        tracing::info!(conn_index, "Connection registered with the edge");
    }

    fn send_reconnect(&self, conn_index: u8) {
        tracing::info!(conn_index, "Connection is being re-established");
    }

    fn send_disconnect(&self, conn_index: u8) {
        tracing::info!(conn_index, "Connection disconnected");
    }
}
