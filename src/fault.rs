use std::{any::Any, net::SocketAddr};

use tokio::{sync::mpsc::UnboundedSender, task::JoinError};

use crate::error::ServerError;

// Reports panics in the tasks of a connection to the accept loop.
#[derive(Clone, Debug)]
pub(crate) struct FaultReporter {
    peer: SocketAddr,
    // When set, any panic stops the whole server.
    exit_on_panic: bool,
    fault_tx: UnboundedSender<ServerError>,
}

impl FaultReporter {
    pub(crate) fn new(
        peer: SocketAddr,
        exit_on_panic: bool,
        fault_tx: UnboundedSender<ServerError>,
    ) -> Self {
        FaultReporter {
            peer,
            exit_on_panic,
            fault_tx,
        }
    }

    pub(crate) fn report(&self, message: String) {
        #[cfg(not(coverage_nightly))]
        tracing::error!(peer = %self.peer, %message, "Recovered from panic in connection.");
        if self.exit_on_panic {
            let _ = self.fault_tx.send(ServerError::ConnectionPanicked {
                peer: self.peer,
                message,
            });
        }
    }

    // Cancelled tasks are not faults.
    pub(crate) fn report_join_error(&self, error: JoinError) {
        if error.is_panic() {
            self.report(panic_message(error.into_panic()));
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}
