//! Thread de rede que escuta UDP e alimenta o [`Pipeline`].
//!
//! Ciclo de vida: `NotStarted → Running → Stopped`. O stop é cooperativo:
//! a flag é checada a cada retorno do `recv`, por isso o socket usa timeout
//! de leitura.

use crate::cache::{Clock, SystemClock};
use crate::config::{AppConfig, parse_flag};
use crate::pipeline::{
    MeasurementSink, Pipeline, PipelineConfig, PipelineShared, StatsSnapshot,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use std::io;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tópico de controle que liga/desliga o modo analisador.
pub const ANALYZER_MODE_TOPIC: &str = "analyzerMode";

/// Fonte de datagramas (socket UDP em produção).
pub trait DatagramSource: Send {
    /// Bloqueia até receber um datagrama; timeouts voltam como `TimedOut`/`WouldBlock`.
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl DatagramSource for UdpSocket {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_from(buf).map(|(size, _)| size)
    }
}

/// Origem de um pedido de update vindo do hospedeiro.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Disparo periódico.
    Scheduled,
    /// Disparo manual: limpa o cache de valores antes de continuar.
    Manual,
}

/// Estado da thread do receptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    NotStarted,
    Running,
    /// Só existe dentro de [`ReceiverService::stop`], enquanto espera a
    /// thread; `stop` retorna sempre em `Stopped`, então `state()` nunca o vê.
    Stopping,
    Stopped,
}

/// Erros de ciclo de vida do receptor.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("Falha ao bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("Falha ao configurar socket: {0}")]
    Configure(io::Error),

    #[error("Falha ao criar thread de rede: {0}")]
    Spawn(io::Error),
}

struct Worker {
    handle: JoinHandle<()>,
    /// Desconecta quando a thread termina.
    done: Receiver<()>,
}

/// Dono da thread de recepção e do estado compartilhado do pipeline.
pub struct ReceiverService {
    config: AppConfig,
    pipeline_config: PipelineConfig,
    shared: Arc<PipelineShared>,
    sink: Arc<dyn MeasurementSink>,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
    worker: Option<Worker>,
    state: ReceiverState,
}

impl ReceiverService {
    pub fn new(config: AppConfig, sink: Arc<dyn MeasurementSink>) -> Self {
        Self::with_clock(config, sink, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: AppConfig,
        sink: Arc<dyn MeasurementSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pipeline_config = config.pipeline_config();
        Self {
            shared: Arc::new(PipelineShared::new(&pipeline_config)),
            pipeline_config,
            config,
            sink,
            clock,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            state: ReceiverState::NotStarted,
        }
    }

    pub fn state(&self) -> ReceiverState {
        match self.state {
            // Thread morreu sem stop (panic)
            ReceiverState::Running if !self.is_healthy() => ReceiverState::Stopped,
            state => state,
        }
    }

    pub fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats().snapshot()
    }

    /// Pedido de update do hospedeiro. (Re)inicia o receptor se a thread não estiver viva.
    pub fn trigger(&mut self, source: TriggerSource) -> Result<(), ReceiverError> {
        debug!("Update chamado, trigger={source:?}");
        if source == TriggerSource::Manual {
            self.shared.clear_value_cache();
        }
        if !self.is_healthy() {
            info!("Iniciando receptor UDP");
            self.start()?;
        }
        Ok(())
    }

    /// Faz bind do socket configurado e inicia a thread.
    pub fn start(&mut self) -> Result<(), ReceiverError> {
        if self.is_healthy() {
            return Ok(());
        }
        let addr = self.config.receiver.bind_addr();
        let sock = UdpSocket::bind(&addr).map_err(|source| ReceiverError::Bind {
            addr: addr.clone(),
            source,
        })?;
        sock.set_read_timeout(Some(self.config.receiver.read_timeout()))
            .map_err(ReceiverError::Configure)?;
        info!("Aguardando dados em {addr}");
        self.start_with_source(sock)
    }

    /// Inicia a thread lendo de uma fonte arbitrária.
    pub fn start_with_source<D: DatagramSource + 'static>(
        &mut self,
        source: D,
    ) -> Result<(), ReceiverError> {
        if self.is_healthy() {
            return Ok(());
        }

        // Caches reconstruídos a cada start
        self.shared.clear_value_cache();
        let pipeline = Pipeline::with_shared(
            &self.pipeline_config,
            self.shared.clone(),
            self.clock.clone(),
        );

        // Flag nova: uma thread antiga que não terminou continua parada
        self.stop = Arc::new(AtomicBool::new(false));
        let stop = self.stop.clone();
        let sink = self.sink.clone();
        let buffer_size = self.config.receiver.buffer_size;
        let (done_tx, done_rx) = bounded::<()>(0);

        let handle = std::thread::Builder::new()
            .name("udp-receiver".into())
            .spawn(move || {
                let _done = done_tx;
                receiver_loop(source, pipeline, sink.as_ref(), &stop, buffer_size);
            })
            .map_err(ReceiverError::Spawn)?;

        self.worker = Some(Worker {
            handle,
            done: done_rx,
        });
        self.state = ReceiverState::Running;
        Ok(())
    }

    /// Pede a parada e espera a thread até o timeout configurado.
    pub fn stop(&mut self) {
        debug!("Parando receptor...");
        self.stop.store(true, Ordering::Release);
        let Some(worker) = self.worker.take() else {
            if self.state != ReceiverState::NotStarted {
                self.state = ReceiverState::Stopped;
            }
            return;
        };
        self.state = ReceiverState::Stopping;

        match worker.done.recv_timeout(self.config.receiver.join_timeout()) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                if worker.handle.join().is_err() {
                    error!("Thread do receptor terminou com panic");
                }
                debug!("Receptor parado");
            }
            Err(RecvTimeoutError::Timeout) => {
                // A thread fica solta; termina no próximo recv
                warn!("Receptor não terminou em {:?}", self.config.receiver.join_timeout());
            }
        }
        self.state = ReceiverState::Stopped;
    }

    /// Saudável enquanto a thread do receptor estiver viva.
    pub fn is_healthy(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    pub fn set_analyzer_mode(&self, enabled: bool) {
        info!("Modo analisador: {}", if enabled { "ligado" } else { "desligado" });
        self.shared.set_analyzer_mode(enabled);
    }

    /// Trata uma mensagem de controle recebida do hospedeiro.
    pub fn handle_control_message(&self, topic: &str, message: &str) {
        if topic == ANALYZER_MODE_TOPIC {
            self.set_analyzer_mode(parse_flag(message));
        } else {
            debug!("Tópico de controle desconhecido: {topic}");
        }
    }
}

impl Drop for ReceiverService {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn receiver_loop<D: DatagramSource>(
    mut source: D,
    mut pipeline: Pipeline,
    sink: &dyn MeasurementSink,
    stop: &AtomicBool,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    let shared = pipeline.shared().clone();
    let stats = shared.stats();

    while !stop.load(Ordering::Acquire) {
        match source.recv_datagram(&mut buf) {
            Ok(0) => {
                stats.record_received();
                debug!("Datagrama vazio");
            }
            Ok(size) => {
                stats.record_received();
                if let Err(e) = pipeline.handle_datagram(&buf[..size], sink) {
                    stats.record_error();
                    error!("Erro ao processar datagrama: {e}");
                    debug!(
                        "Erro ao processar datagrama {}: {e:?}",
                        hex::encode_upper(&buf[..size])
                    );
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                // Timeout normal, checa a flag de stop
            }
            Err(e) => {
                stats.record_error();
                error!("Erro ao receber UDP: {e}");
            }
        }
    }

    debug!("Receptor UDP parado");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Value;
    use crate::frame::encode_frame;
    use crate::pipeline::Publication;
    use crossbeam_channel::Sender;
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Fonte alimentada por channel; sem dados vira `TimedOut`.
    struct ChannelSource(Receiver<io::Result<Vec<u8>>>);

    impl DatagramSource for ChannelSource {
        fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv_timeout(Duration::from_millis(20)) {
                Ok(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::ErrorKind::TimedOut.into()),
            }
        }
    }

    fn service(config: AppConfig) -> (ReceiverService, Receiver<Publication>) {
        let (tx, rx) = bounded::<Publication>(256);
        let sink: Arc<dyn MeasurementSink> = Arc::new(tx);
        (ReceiverService::new(config, sink), rx)
    }

    fn channel_source() -> (Sender<io::Result<Vec<u8>>>, ChannelSource) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (tx, ChannelSource(rx))
    }

    fn recv_all(rx: &Receiver<Publication>, count: usize) -> Vec<(&'static str, Value)> {
        (0..count)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .map(|p| (p.name, p.value))
            .collect()
    }

    #[test]
    fn lifecycle() {
        let (mut svc, _rx) = service(AppConfig::default());
        assert_eq!(svc.state(), ReceiverState::NotStarted);
        assert!(!svc.is_healthy());

        let (_tx, source) = channel_source();
        svc.start_with_source(source).unwrap();
        assert_eq!(svc.state(), ReceiverState::Running);
        assert!(svc.is_healthy());

        svc.stop();
        assert_eq!(svc.state(), ReceiverState::Stopped);
        assert!(!svc.is_healthy());
    }

    #[test]
    fn errors_do_not_stop_the_loop() {
        let (mut svc, rx) = service(AppConfig::default());
        let (tx, source) = channel_source();
        svc.start_with_source(source).unwrap();

        tx.send(Err(io::Error::other("falha simulada"))).unwrap();
        tx.send(Ok(encode_frame(0x22, 0x11, 0x71, &[1, 2]))).unwrap();
        tx.send(Ok(Vec::new())).unwrap();
        tx.send(Ok(encode_frame(0x22, 0x11, 0x21, &[2, 1, 0, 5]))).unwrap();

        assert_eq!(
            recv_all(&rx, 3),
            vec![
                ("operatingMode", Value::Int(2)),
                ("unitState", Value::Int(1)),
                ("fanSpeed", Value::Int(5)),
            ]
        );
        assert!(svc.is_healthy());

        let stats = svc.stats();
        assert_eq!(stats.received_messages, 3);
        assert_eq!(stats.received_message_errors, 2);
        svc.stop();
    }

    #[test]
    fn manual_trigger_forces_republish() {
        let (mut svc, rx) = service(AppConfig::default());
        let (tx, source) = channel_source();
        svc.start_with_source(source).unwrap();

        let frame = encode_frame(0x22, 0x11, 0x21, &[2, 1, 0, 5]);
        tx.send(Ok(frame)).unwrap();
        assert_eq!(recv_all(&rx, 3).len(), 3);

        // Outra chave com os mesmos valores não gera publicação...
        let other_destination = encode_frame(0x23, 0x11, 0x21, &[2, 1, 0, 5]);
        tx.send(Ok(other_destination)).unwrap();
        assert!(wait_until(Duration::from_secs(2), || svc.stats().decoded_frames == 2));
        assert!(rx.try_recv().is_err());

        // ...mas depois do trigger manual, sim
        svc.trigger(TriggerSource::Manual).unwrap();
        let another = encode_frame(0x24, 0x11, 0x21, &[2, 1, 0, 5]);
        tx.send(Ok(another)).unwrap();
        assert_eq!(recv_all(&rx, 3).len(), 3);
        svc.stop();
    }

    #[test]
    fn analyzer_topic_toggles_mode() {
        let (svc, _rx) = service(AppConfig::default());
        svc.handle_control_message(ANALYZER_MODE_TOPIC, "Yes");
        assert!(svc.shared().analyzer_mode());
        svc.handle_control_message(ANALYZER_MODE_TOPIC, "off");
        assert!(!svc.shared().analyzer_mode());
        svc.handle_control_message("other", "1");
        assert!(!svc.shared().analyzer_mode());
    }

    #[test]
    fn end_to_end_over_udp() {
        let (mut svc, rx) = service(AppConfig::default());
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let addr = sock.local_addr().unwrap();
        svc.start_with_source(sock).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .send_to(&encode_frame(0x22, 0x11, 0x21, &[2, 1, 0, 0x05]), addr)
            .unwrap();

        assert_eq!(
            recv_all(&rx, 3),
            vec![
                ("operatingMode", Value::Int(2)),
                ("unitState", Value::Int(1)),
                ("fanSpeed", Value::Int(5)),
            ]
        );
        svc.stop();
        assert_eq!(svc.state(), ReceiverState::Stopped);
    }

    #[test]
    fn trigger_binds_configured_port() {
        let mut config = AppConfig::default();
        config.receiver.bind_ip = "127.0.0.1".into();
        config.receiver.read_timeout_ms = 50;
        // Porta ocupada → erro de bind, receptor continua parado
        let busy = UdpSocket::bind("127.0.0.1:0").unwrap();
        config.receiver.port = busy.local_addr().unwrap().port();

        let (mut svc, _rx) = service(config);
        assert!(matches!(
            svc.trigger(TriggerSource::Scheduled),
            Err(ReceiverError::Bind { .. })
        ));
        assert_eq!(svc.state(), ReceiverState::NotStarted);

        drop(busy);
        svc.trigger(TriggerSource::Scheduled).unwrap();
        assert!(svc.is_healthy());
        svc.stop();
    }
}
