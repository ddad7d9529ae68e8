use crate::router::{InboundMessage, MessageRouter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// File tampon entre le transport et le routeur
pub fn ingest_queue(capacity: usize) -> (mpsc::Sender<InboundMessage>, mpsc::Receiver<InboundMessage>) {
    mpsc::channel(capacity.max(1))
}

/// Consomme la file un message à la fois ; le message en cours est terminé avant l'arrêt
pub async fn run_ingest(router: MessageRouter, mut rx: mpsc::Receiver<InboundMessage>, token: CancellationToken) {
    info!("ingest worker started");
    loop {
        let msg = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let outcome = router.route(msg).await;
        debug!(?outcome, "message routed");
    }
    info!("ingest worker stopped");
}
