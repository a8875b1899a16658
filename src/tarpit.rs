use std::{net::SocketAddr, time::Duration};

use bon::Builder;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::sleep,
};

// Canned response sent to blacklisted clients before dropping them.
pub(crate) const BLACKLIST_RESPONSE: &[u8] = b"HTTP/1.0 400 Bad request\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
Content-Type: text/html\r\n\
Server: Apache/1.3.3.7 (Unix)\r\n\
\r\n\
<html><body><h1>400 Bad request</h1>\n\
Your browser sent an invalid request.\n\
</body></html>\n";

// How a tarpitted connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TarpitOutcome {
    // The timer fired and the canned response was sent.
    TimedOut,
    // The client went away first.
    Disconnected,
}

// Stalls blacklisted connections without ever speaking SSH to them.
#[derive(Debug, Clone, Builder)]
pub(crate) struct Tarpit {
    // Time until the canned response is sent and the connection dropped.
    drop_after: Duration,
    // Delay between each single-byte read.
    #[builder(default = Duration::from_millis(10))]
    read_delay: Duration,
}

impl Tarpit {
    pub(crate) async fn handle<S>(&self, mut stream: S, peer: SocketAddr) -> TarpitOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        #[cfg(not(coverage_nightly))]
        tracing::info!(%peer, "Received connection from blacklisted IP, delaying and dropping...");
        let (mut reader, mut writer) = tokio::io::split(&mut stream);
        let read_delay = self.read_delay;
        let outcome = tokio::select! {
            _ = sleep(self.drop_after) => TarpitOutcome::TimedOut,
            _ = async {
                // Starve the client of resources
                let mut buf = [0u8; 1];
                while let Ok(1) = reader.read(&mut buf).await {
                    sleep(read_delay).await;
                }
            } => TarpitOutcome::Disconnected,
        };
        if outcome == TarpitOutcome::TimedOut {
            if let Err(error) = writer.write_all(BLACKLIST_RESPONSE).await {
                #[cfg(not(coverage_nightly))]
                tracing::debug!(%peer, %error, "Unable to send response to blacklisted IP.");
            }
        }
        let _ = writer.shutdown().await;
        #[cfg(not(coverage_nightly))]
        tracing::debug!(%peer, ?outcome, "Dropped blacklisted connection.");
        outcome
    }
}
