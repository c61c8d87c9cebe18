//! Boundary listener: where proxied traffic observations enter the service.
//!
//! The proxy host connects over TCP and pushes `ExchangeEvent` frames
//! (4-byte Little Endian length prefix + MessagePack). Each boundary
//! connection gets its own `Interceptor`; when the connection ends, its
//! in-flight exchanges are abandoned with it.

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

use memtap_core::config::InterceptConfig;
use memtap_core::ipc::ExchangeEvent;

use crate::subsystems::assemble::AbortReason;
use crate::subsystems::intercept::Interceptor;
use crate::subsystems::sync::SyncHandle;

pub async fn run_boundary_listener(
    config: InterceptConfig,
    user_id: String,
    sync: SyncHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Boundary listener on {}", addr);

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, peer) = res?;
                tracing::info!(peer = %peer, "boundary connection accepted");
                let mut interceptor = Interceptor::new(&config, user_id.clone(), sync.clone());
                let mut conn_shutdown = shutdown.resubscribe();

                tokio::spawn(async move {
                    let codec = LengthDelimitedCodec::builder().little_endian().new_codec();
                    let mut framed = FramedRead::new(stream, codec);
                    let mut teardown = AbortReason::ConnectionClosed;

                    loop {
                        tokio::select! {
                            frame = framed.next() => match frame {
                                None => break,
                                Some(Err(e)) => {
                                    tracing::error!(error = %e, "boundary frame error");
                                    break;
                                }
                                Some(Ok(bytes)) => match rmp_serde::from_slice::<ExchangeEvent>(&bytes) {
                                    Ok(event) => interceptor.observe(event),
                                    Err(e) => {
                                        tracing::warn!(error = %e, "undecodable boundary frame skipped");
                                    }
                                },
                            },
                            _ = conn_shutdown.recv() => {
                                teardown = AbortReason::Shutdown;
                                break;
                            }
                        }
                    }

                    interceptor.close(teardown);
                    tracing::info!(peer = %peer, "boundary connection closed");
                });
            }
            _ = shutdown.recv() => {
                tracing::info!("Boundary listener shutting down");
                break;
            }
        }
    }

    Ok(())
}
