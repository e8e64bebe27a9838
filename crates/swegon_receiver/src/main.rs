//! # Swegon Receiver
//!
//! Escuta a telemetria UDP da unidade de ventilação, decodifica as
//! mensagens e publica cada valor novo como uma linha `nome = valor` no
//! stdout.
//!
//! ## Comandos (stdin)
//! - `refresh`: trigger manual, republica todos os valores
//! - `analyzer <yes|no>`: liga/desliga o modo analisador
//! - `status`: health check e contadores
//! - `quit` / EOF: encerra

mod control;

use control::Command;
use crossbeam_channel::{bounded, select, tick};
use std::sync::Arc;
use std::time::Duration;
use swegon_core::config::AppConfig;
use swegon_core::pipeline::{MeasurementSink, Publication};
use swegon_core::receiver::{ANALYZER_MODE_TOPIC, ReceiverService, TriggerSource};
use tracing::{error, info, warn};

fn main() {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Config ──
    let config_path = AppConfig::default_path();
    let mut config = AppConfig::load(&config_path);

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }
    config.apply_env_overrides();

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("{e}");
        }
        std::process::exit(1);
    }

    // ── Receptor ──
    let (tx, publications) = bounded::<Publication>(config.host.channel_capacity);
    let sink: Arc<dyn MeasurementSink> = Arc::new(tx);
    let update_interval = Duration::from_secs(config.host.update_interval_secs);
    let mut service = ReceiverService::new(config, sink);

    // Sem socket ainda: o ticker tenta de novo a cada intervalo
    if let Err(e) = service.trigger(TriggerSource::Scheduled) {
        error!("{e}");
        warn!("Nova tentativa em {update_interval:?}");
    }

    let commands = control::spawn_stdin_reader();
    let ticker = tick(update_interval);

    // ── Loop principal ──
    loop {
        select! {
            recv(publications) -> msg => match msg {
                Ok(p) => println!("{} = {}", p.name, p.value),
                Err(_) => break,
            },
            recv(commands) -> msg => match msg {
                Ok(Command::Refresh) => {
                    if let Err(e) = service.trigger(TriggerSource::Manual) {
                        error!("{e}");
                    }
                }
                Ok(Command::Analyzer(value)) => {
                    service.handle_control_message(ANALYZER_MODE_TOPIC, &value);
                }
                Ok(Command::Status) => {
                    let stats = service.stats();
                    info!(
                        "Status: ok={} recebidos={} erros={} rejeitados={} throttled={} pub={}",
                        service.is_healthy(),
                        stats.received_messages,
                        stats.received_message_errors,
                        stats.rejected_frames,
                        stats.throttled_frames,
                        stats.published_values
                    );
                }
                Ok(Command::Quit) | Err(_) => break,
            },
            recv(ticker) -> _ => {
                if !service.is_healthy() {
                    warn!("Receptor UDP não está rodando, reiniciando");
                }
                if let Err(e) = service.trigger(TriggerSource::Scheduled) {
                    error!("{e}");
                }
            },
        }
    }

    service.stop();
    info!("Encerrado");
}
