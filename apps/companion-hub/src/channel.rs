use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::DeviceCommand;

/// Control frames consumed by a device connection's writer task
#[derive(Debug, PartialEq)]
pub enum Outbound {
    Frame(DeviceCommand),
    Close,
}

/// Handle to one physical device connection.
///
/// The handle only enqueues typed frames; serialization and the actual socket
/// write happen in the connection's writer task. Each handle carries the id of
/// the connection it was created for, so a stale handle left over from a
/// superseded connection can be told apart from the live one.
#[derive(Debug, Clone)]
pub struct DeviceChannel {
    connection_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl DeviceChannel {
    pub fn new(connection_id: String, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Enqueue a frame for the device. A dead connection is logged, not
    /// surfaced: there is no delivery acknowledgement on this channel.
    pub fn send(&self, frame: DeviceCommand) {
        if self.tx.send(Outbound::Frame(frame)).is_err() {
            warn!(
                connection = %self.connection_id,
                "dropping frame for closed device channel"
            );
        }
    }

    /// Ask the writer task to close the underlying socket. Idempotent.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_enqueues_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = DeviceChannel::new("conn-1".to_string(), tx);
        channel.send(DeviceCommand::Stop);
        assert_eq!(rx.try_recv().unwrap(), Outbound::Frame(DeviceCommand::Stop));
    }

    #[test]
    fn send_after_receiver_dropped_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let channel = DeviceChannel::new("conn-1".to_string(), tx);
        // Must not panic or error; the failure goes to the log only.
        channel.send(DeviceCommand::Stop);
        channel.close();
    }

    #[test]
    fn close_enqueues_close_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = DeviceChannel::new("conn-1".to_string(), tx);
        channel.close();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }
}
