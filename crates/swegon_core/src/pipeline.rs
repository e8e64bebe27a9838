//! Pipeline de um datagrama: split → CRC → throttle → decode → cache de valores → sink.
//!
//! Todo o processamento roda na thread do receptor. O que é tocado por
//! outras threads (cache de valores, modo analisador, contadores) fica em
//! [`PipelineShared`].

use crate::cache::{Clock, TtlCache};
use crate::decode::{self, DecodeError, MessageType, Value};
use crate::diff::DiffHistory;
use crate::frame::{self, FrameError, Message, MessageKey};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Destino das medições publicadas (no serviço real, o transporte MQTT).
pub trait MeasurementSink: Send + Sync {
    fn publish(&self, name: &'static str, value: Value, retain: bool);
}

/// Uma publicação entregue via channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publication {
    pub name: &'static str,
    pub value: Value,
    pub retain: bool,
}

impl MeasurementSink for crossbeam_channel::Sender<Publication> {
    fn publish(&self, name: &'static str, value: Value, retain: bool) {
        // Non-blocking: se o consumidor está lento, descarta
        if self.try_send(Publication { name, value, retain }).is_err() {
            warn!("Channel de publicação cheio/fechado, descartando {name} = {value}");
        }
    }
}

/// Erros que abortam o processamento de um datagrama.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("Mensagem {key} inválida: {source}")]
    Decode {
        key: MessageKey,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Parâmetros do pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// TTL do throttle por [`MessageKey`].
    pub msg_throttle: Duration,
    /// TTL do cache de valores publicados.
    pub value_ttl: Duration,
    /// Capacidade de cada cache.
    pub capacity: usize,
    pub analyzer_mode: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            msg_throttle: Duration::from_secs(5),
            value_ttl: Duration::from_secs(300),
            capacity: 256,
            analyzer_mode: false,
        }
    }
}

/// Contadores do pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received_messages: AtomicU64,
    received_message_errors: AtomicU64,
    rejected_frames: AtomicU64,
    throttled_frames: AtomicU64,
    decoded_frames: AtomicU64,
    published_values: AtomicU64,
}

/// Cópia dos contadores em um instante.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received_messages: u64,
    pub received_message_errors: u64,
    pub rejected_frames: u64,
    pub throttled_frames: u64,
    pub decoded_frames: u64,
    pub published_values: u64,
}

impl PipelineStats {
    pub fn record_received(&self) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.received_message_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received_messages: self.received_messages.load(Ordering::Relaxed),
            received_message_errors: self.received_message_errors.load(Ordering::Relaxed),
            rejected_frames: self.rejected_frames.load(Ordering::Relaxed),
            throttled_frames: self.throttled_frames.load(Ordering::Relaxed),
            decoded_frames: self.decoded_frames.load(Ordering::Relaxed),
            published_values: self.published_values.load(Ordering::Relaxed),
        }
    }
}

/// Estado compartilhado entre a thread do receptor e quem a controla.
#[derive(Debug)]
pub struct PipelineShared {
    values: Mutex<TtlCache<&'static str, Value>>,
    analyzer_mode: AtomicBool,
    stats: PipelineStats,
}

impl PipelineShared {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            values: Mutex::new(TtlCache::new(config.value_ttl, config.capacity)),
            analyzer_mode: AtomicBool::new(config.analyzer_mode),
            stats: PipelineStats::default(),
        }
    }

    /// Esquece os valores publicados; o próximo valor de cada medição sai de novo.
    pub fn clear_value_cache(&self) {
        self.values.lock().clear();
    }

    pub fn analyzer_mode(&self) -> bool {
        self.analyzer_mode.load(Ordering::Relaxed)
    }

    pub fn set_analyzer_mode(&self, enabled: bool) {
        self.analyzer_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }
}

/// Pipeline completo; pertence à thread do receptor.
pub struct Pipeline {
    throttle: TtlCache<MessageKey, Vec<u8>>,
    history: DiffHistory,
    shared: Arc<PipelineShared>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_shared(config, Arc::new(PipelineShared::new(config)), clock)
    }

    /// Usa um estado compartilhado já existente (reinício do receptor).
    pub fn with_shared(
        config: &PipelineConfig,
        shared: Arc<PipelineShared>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            throttle: TtlCache::new(config.msg_throttle, config.capacity),
            history: DiffHistory::new(),
            shared,
            clock,
        }
    }

    pub fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }

    /// Processa um datagrama inteiro. Um erro interrompe os frames restantes.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        sink: &dyn MeasurementSink,
    ) -> Result<(), PipelineError> {
        debug!("Datagrama recebido: {}", hex::encode_upper(data));
        for candidate in frame::split_datagram(data) {
            self.handle_frame(&candidate, sink)?;
        }
        Ok(())
    }

    fn handle_frame(
        &mut self,
        candidate: &[u8],
        sink: &dyn MeasurementSink,
    ) -> Result<(), PipelineError> {
        let analyzer = self.shared.analyzer_mode();

        let message = match frame::verify_frame(candidate) {
            Ok(message) => message,
            Err(e) => {
                self.shared.stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                if analyzer {
                    error!("Frame descartado ({e}), PDU: {}", hex::encode_upper(candidate));
                } else {
                    trace!("Frame descartado ({e}), PDU: {}", hex::encode_upper(candidate));
                }
                return Ok(());
            }
        };
        trace!("CRC OK, mensagem: {}", hex::encode_upper(message));

        let parsed = Message::parse(message)?;
        let key = parsed.key();

        if analyzer {
            let diff = self.history.record(key, message);
            error!("Diff ({key}): {diff}");
        }

        let now = self.clock.now();
        if self.throttle.contains(&key, now) {
            self.shared.stats.throttled_frames.fetch_add(1, Ordering::Relaxed);
            debug!("Ignorando mensagem {key} (throttle)");
            return Ok(());
        }

        debug!(
            "Mensagem {key}: first=0x{:02X} len=0x{:02X} dados={}",
            parsed.first_byte,
            parsed.data_len,
            hex::encode_upper(parsed.payload)
        );

        match MessageType::from_byte(parsed.msg_type) {
            Some(msg_type) => {
                let measurements = decode::decode(msg_type, parsed.payload)
                    .map_err(|source| PipelineError::Decode { key, source })?;
                self.shared.stats.decoded_frames.fetch_add(1, Ordering::Relaxed);
                for m in measurements {
                    self.publish_value(m.name, m.value, sink);
                }
            }
            None => trace!("Tipo de mensagem não suportado: 0x{:02X}", parsed.msg_type),
        }

        self.throttle.insert(key, message.to_vec(), now);
        Ok(())
    }

    /// Publica `value` se for novo ou diferente do último publicado.
    fn publish_value(&self, name: &'static str, value: Value, sink: &dyn MeasurementSink) {
        let now = self.clock.now();
        {
            let mut values = self.shared.values.lock();
            match values.get(&name, now) {
                None => debug!("{name}: sem valor em cache"),
                Some(previous) if *previous == value => {
                    debug!("{name} = {value}: mesmo valor, ignorando");
                    return;
                }
                Some(_) => {}
            }
            values.insert(name, value, now);
        }

        info!("{name} = {value}");
        self.shared.stats.published_values.fetch_add(1, Ordering::Relaxed);
        sink.publish(name, value, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::frame::encode_frame;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Publication>>);

    impl Collect {
        fn take(&self) -> Vec<(&'static str, Value)> {
            self.0.lock().drain(..).map(|p| (p.name, p.value)).collect()
        }
    }

    impl MeasurementSink for Collect {
        fn publish(&self, name: &'static str, value: Value, retain: bool) {
            self.0.lock().push(Publication { name, value, retain });
        }
    }

    fn setup() -> (Pipeline, Arc<ManualClock>, Collect) {
        let clock = Arc::new(ManualClock::new());
        let pipeline = Pipeline::new(&PipelineConfig::default(), clock.clone());
        (pipeline, clock, Collect::default())
    }

    fn mode_frame(mode: u8, fan: u8) -> Vec<u8> {
        encode_frame(0x22, 0x11, 0x21, &[mode, 1, 0, fan])
    }

    #[test]
    fn publishes_mode_state() {
        let (mut p, _clock, sink) = setup();
        p.handle_datagram(&mode_frame(2, 0x05), &sink).unwrap();
        assert!(sink.0.lock().iter().all(|p| !p.retain));
        assert_eq!(
            sink.take(),
            vec![
                ("operatingMode", Value::Int(2)),
                ("unitState", Value::Int(1)),
                ("fanSpeed", Value::Int(5)),
            ]
        );
    }

    #[test]
    fn huge_ttls_do_not_overflow_the_clock() {
        let clock = Arc::new(ManualClock::new());
        let config = PipelineConfig {
            msg_throttle: Duration::from_secs(u64::MAX),
            value_ttl: Duration::from_secs(u64::MAX),
            ..PipelineConfig::default()
        };
        let mut p = Pipeline::new(&config, clock.clone());
        let sink = Collect::default();

        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        assert_eq!(sink.take().len(), 3);

        clock.advance(Duration::from_secs(86_400));
        p.handle_datagram(&mode_frame(3, 1), &sink).unwrap();
        assert!(sink.take().is_empty());
        assert_eq!(p.shared().stats().snapshot().throttled_frames, 1);
    }

    #[test]
    fn throttle_skips_same_key_within_ttl() {
        let (mut p, clock, sink) = setup();
        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        sink.take();

        // Mesmo key com payload diferente ainda é suprimido
        clock.advance(Duration::from_secs(1));
        p.handle_datagram(&mode_frame(3, 1), &sink).unwrap();
        assert!(sink.take().is_empty());
        assert_eq!(p.shared().stats().snapshot().decoded_frames, 1);
        assert_eq!(p.shared().stats().snapshot().throttled_frames, 1);

        clock.advance(Duration::from_secs(5));
        p.handle_datagram(&mode_frame(3, 1), &sink).unwrap();
        assert_eq!(sink.take(), vec![("operatingMode", Value::Int(3))]);
        assert_eq!(p.shared().stats().snapshot().decoded_frames, 2);
    }

    #[test]
    fn throttle_is_per_key() {
        let (mut p, _clock, sink) = setup();
        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        let other_source = encode_frame(0x22, 0x12, 0x21, &[4, 1, 0, 1]);
        p.handle_datagram(&other_source, &sink).unwrap();
        assert_eq!(p.shared().stats().snapshot().decoded_frames, 2);
    }

    #[test]
    fn value_gate_lifecycle() {
        let (mut p, clock, sink) = setup();
        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        assert_eq!(sink.take().len(), 3);

        // Valores iguais não são republicados dentro do TTL
        clock.advance(Duration::from_secs(10));
        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        assert!(sink.take().is_empty());

        // Depois do TTL, republica mesmo sem mudança
        clock.advance(Duration::from_secs(300));
        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        assert_eq!(sink.take().len(), 3);

        // Reset manual força republicação imediata
        clock.advance(Duration::from_secs(10));
        p.shared().clear_value_cache();
        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        assert_eq!(sink.take().len(), 3);
    }

    #[test]
    fn suppressed_values_do_not_refresh_ttl() {
        let (mut p, clock, sink) = setup();
        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        sink.take();

        clock.advance(Duration::from_secs(200));
        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        assert!(sink.take().is_empty());

        // 300s desde a última publicação, não desde a última supressão
        clock.advance(Duration::from_secs(100));
        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        assert_eq!(sink.take().len(), 3);
    }

    #[test]
    fn several_frames_in_one_datagram() {
        let (mut p, _clock, sink) = setup();
        let mut datagram = mode_frame(2, 3);
        let mut status = [0u8; 15];
        status[0] = 0x01;
        datagram.extend(encode_frame(0x22, 0x11, 0x73, &status));

        p.handle_datagram(&datagram, &sink).unwrap();
        let published = sink.take();
        assert_eq!(published.len(), 3 + 36);
        assert!(published.contains(&("heatingState", Value::Bool(true))));
    }

    #[test]
    fn bad_crc_and_unknown_type_are_dropped() {
        let (mut p, _clock, sink) = setup();
        let mut corrupted = mode_frame(2, 1);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;
        p.handle_datagram(&corrupted, &sink).unwrap();

        p.handle_datagram(&encode_frame(0x22, 0x11, 0x42, &[1, 2, 3]), &sink)
            .unwrap();

        assert!(sink.take().is_empty());
        let stats = p.shared().stats().snapshot();
        assert_eq!(stats.rejected_frames, 1);
        assert_eq!(stats.decoded_frames, 0);
    }

    #[test]
    fn short_payload_is_a_datagram_error() {
        let (mut p, _clock, sink) = setup();
        let short = encode_frame(0x22, 0x11, 0x71, &[1, 2, 3]);
        let err = p.handle_datagram(&short, &sink).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Decode {
                source: DecodeError::PayloadTooShort { expected: 13, .. },
                ..
            }
        ));

        // A chave não entra no throttle, então um frame válido passa em seguida
        let mut data = [0u8; 13];
        data[2] = 5;
        p.handle_datagram(&encode_frame(0x22, 0x11, 0x71, &data), &sink)
            .unwrap();
        assert_eq!(sink.take().len(), 15);
    }

    #[test]
    fn analyzer_mode_does_not_gate() {
        let (mut p, _clock, sink) = setup();
        p.shared().set_analyzer_mode(true);
        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        p.handle_datagram(&mode_frame(2, 1), &sink).unwrap();
        assert_eq!(sink.take().len(), 3);
        assert_eq!(p.history.len(), 1);
    }

    #[test]
    fn channel_sink_forwards_publications() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        tx.publish("co2", Value::Int(40), false);
        assert_eq!(rx.try_recv().unwrap(), Publication {
            name: "co2",
            value: Value::Int(40),
            retain: false,
        });
    }
}
