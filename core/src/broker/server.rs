use crate::broker::session::serve_connection;
use crate::broker::Broker;
use crate::dump::PcapDumper;
use crate::log_sink::{FileLogSink, LogSink};
use crate::{config::BrokerConfig, CellaservError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

pub struct BrokerServer {
    config: BrokerConfig,
    broker: Arc<Broker>,
    listener: TcpListener,
}

impl BrokerServer {
    /// Validate `config`, open the log session and capture file, and bind the listener.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let log_sink: Arc<dyn LogSink> = Arc::new(FileLogSink::new(&config.log_root));
        Self::bind_with_sink(config, log_sink).await
    }

    pub async fn bind_with_sink(config: BrokerConfig, log_sink: Arc<dyn LogSink>) -> Result<Self> {
        config.validate().map_err(CellaservError::Config)?;

        let mut broker = Broker::new(&config, log_sink);
        if let Some(path) = &config.dump_file {
            match PcapDumper::create(path, config.max_frame_size) {
                Ok(dumper) => broker = broker.with_dumper(Arc::new(dumper)),
                Err(e) => error!("[Dump] Could not open {}: {}", path.display(), e),
            }
        }

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| CellaservError::Network(format!("Could not listen on {}: {}", addr, e)))?;

        Ok(Self {
            config,
            broker: Arc::new(broker),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    /// Initiate graceful shutdown of the server
    pub fn shutdown(&self) {
        self.broker.shutdown();
    }

    /// Accept clients until shutdown is requested, either through
    /// [`shutdown`](Self::shutdown) or the `shutdown` administrative command.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.broker.shutdown_signal();
        info!("[Net] Listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => self.spawn_session(stream, peer_addr),
                        Err(e) => error!("[Net] Could not accept: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("[Net] Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        self.broker.flush_dump();
        let snapshot = self.broker.metrics().snapshot();
        match snapshot.to_json() {
            Ok(json) => info!("[Net] Final metrics: {}", json),
            Err(e) => warn!("[Net] Could not encode metrics: {}", e),
        }
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = Self::optimize_client_socket(&stream) {
            warn!("[Net] Failed to tune socket of {}: {}", peer_addr, e);
        }

        let broker = Arc::clone(&self.broker);
        let max_frame_size = self.config.max_frame_size;
        tokio::spawn(async move {
            match serve_connection(broker, stream, peer_addr, max_frame_size).await {
                Ok(()) => debug!("[Net] {} closed the connection", peer_addr),
                Err(e) => warn!("[Net] {}: {}", peer_addr, e),
            }
        });
    }

    fn optimize_client_socket(stream: &TcpStream) -> Result<()> {
        use socket2::SockRef;

        let socket_ref = SockRef::from(stream);

        // Small frames, latency matters more than throughput
        socket_ref.set_tcp_nodelay(true)?;
        socket_ref.set_keepalive(true)?;

        Ok(())
    }
}
