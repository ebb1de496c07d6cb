//! Server bootstrap: the listener, the controller task, and shutdown

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use shoal_cluster::{spawn_link, ClusterResult, Controller, ControllerConfig, Event};
use shoal_core::ShoalConfig;

/// The cluster node server.
pub struct ShoalServer {
    config: ShoalConfig,
}

impl ShoalServer {
    pub fn new(config: ShoalConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> ClusterResult<()> {
        self.config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = Controller::new(
            ControllerConfig::from_config(&self.config),
            events_tx.clone(),
        )?;

        let addr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, advertised = %self.config.advertised(), "shoald listening");

        let accept_events = events_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let link = spawn_link(accept_events.clone(), stream);
                        if accept_events.send(Event::LinkOpened { link }).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%e, "accept failed"),
                }
            }
        });

        let shutdown_events = events_tx;
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; draining node");
                let _ = shutdown_events.send(Event::Shutdown);
            }
        });

        controller.run(events_rx).await;
        Ok(())
    }
}
