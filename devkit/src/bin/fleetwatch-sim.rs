use anyhow::{bail, Result};
use fleetwatch_devkit::{run_simulation, SimConfig, Simulator};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = SimConfig::from_env();
    let (host, port) = cfg.broker();
    log::info!("[sim] connecting to {host}:{port} as {}", cfg.device_id);

    let mut opts = MqttOptions::new(format!("fleetwatch-sim-{}", cfg.device_id), host, port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    // attente du ConnAck avant toute publication
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => break,
            Ok(_) => {}
            Err(e) => bail!("MQTT connection failed: {e}"),
        }
    }
    log::info!("[sim] connected");

    // l'event loop doit continuer de tourner pour que les publish partent
    let pump = tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                log::warn!("[sim] MQTT error: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let seed = chrono::Utc::now().timestamp_millis() as u64;
    let mut sim = Simulator::new(&cfg, seed);
    let frames = cfg
        .duration
        .map(|d| (d.as_millis() / cfg.interval.as_millis().max(1)) as usize);
    let sent = run_simulation(&client, &mut sim, frames, cfg.interval).await?;

    log::info!("[sim] stopping after {sent} frames");
    client.disconnect().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    pump.abort();
    Ok(())
}
